use reqwest::Url;

use crate::errors::AppResult;

/// Pulls every http(s) URL out of free text, e.g. a pasted or dropped
/// selection. Order is preserved and duplicates are dropped.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
        push_if_url(&mut urls, token);
    }
    urls
}

/// Reads URLs from a CSV export. A `url` column is used when the header has
/// one; otherwise every cell is scanned.
pub fn parse_url_csv(bytes: &[u8]) -> AppResult<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut records = reader.records();
    let mut urls = Vec::new();
    let Some(first) = records.next().transpose()? else {
        return Ok(urls);
    };

    let url_column = first
        .iter()
        .position(|cell| cell.trim().eq_ignore_ascii_case("url"));
    if url_column.is_none() {
        for cell in first.iter() {
            push_if_url(&mut urls, cell);
        }
    }

    for record in records {
        let record = record?;
        match url_column {
            Some(column) => {
                if let Some(cell) = record.get(column) {
                    push_if_url(&mut urls, cell);
                }
            }
            None => {
                for cell in record.iter() {
                    push_if_url(&mut urls, cell);
                }
            }
        }
    }
    Ok(urls)
}

fn push_if_url(urls: &mut Vec<String>, candidate: &str) {
    let candidate = candidate.trim().trim_matches(|c| matches!(c, '"' | '\'' | '<' | '>'));
    if candidate.is_empty() {
        return;
    }
    let Ok(url) = Url::parse(candidate) else {
        return;
    };
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return;
    }
    let normalized = url.to_string();
    if !urls.contains(&normalized) {
        urls.push(normalized);
    }
}
