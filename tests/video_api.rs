use std::time::Duration;

use httptest::matchers::{all_of, eq, json_decoded, request};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::json;

use catalog_import_sync::{HttpVideoApi, Stage, VideoApi};

fn api_for(server: &Server) -> HttpVideoApi {
    let base = server.url("/api").to_string();
    HttpVideoApi::new(&base, Duration::from_secs(5)).expect("api client")
}

#[tokio::test]
async fn lists_videos_with_import_fields() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/api/lists/favourites/videos")
        ))
        .respond_with(json_encoded(json!([
            {
                "id": "v1",
                "title": "Keynote",
                "url": "https://youtu.be/a",
                "import_stage": "captions",
                "import_progress": 50
            },
            {
                "id": "v2",
                "title": "Old upload",
                "import_stage": null,
                "import_progress": null
            }
        ]))),
    );

    let videos = api_for(&server)
        .list_videos("favourites")
        .await
        .expect("list videos");

    assert_eq!(videos.len(), 2);
    assert_eq!(videos[0].import_stage, Some(Stage::Captions));
    assert_eq!(videos[0].import_progress, Some(50));
    assert!(!videos[0].is_settled());
    assert!(videos[1].is_settled());
}

#[tokio::test]
async fn bulk_import_posts_urls_and_reads_outcome() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("POST"),
            request::path("/api/lists/favourites/videos/bulk"),
            request::body(json_decoded(eq(json!({
                "urls": ["https://youtu.be/a", "https://youtu.be/broken"]
            }))))
        ))
        .respond_with(json_encoded(json!({
            "created": [
                {
                    "id": "v9",
                    "url": "https://youtu.be/a",
                    "import_stage": "created",
                    "import_progress": 0
                }
            ],
            "failed": [
                { "url": "https://youtu.be/broken", "error": "unsupported host" }
            ]
        }))),
    );

    let urls = vec![
        "https://youtu.be/a".to_string(),
        "https://youtu.be/broken".to_string(),
    ];
    let result = api_for(&server)
        .bulk_import("favourites", &urls)
        .await
        .expect("bulk import");

    assert_eq!(result.created.len(), 1);
    assert_eq!(result.created[0].import_stage, Some(Stage::Created));
    assert_eq!(result.failed[0].error, "unsupported host");
}

#[tokio::test]
async fn surfaces_server_errors() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::path("/api/lists/favourites/videos"))
            .respond_with(status_code(503)),
    );

    let result = api_for(&server).list_videos("favourites").await;
    assert!(result.is_err());
}
