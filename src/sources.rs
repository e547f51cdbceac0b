//! Stream list loading from config lines and remote lists.

use crate::config::ConfigError;
use crate::model::{Stream, StreamType};

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// Split a stream line into `(uri, name, title)`.
///
/// Both `title uri` and `uri title` are accepted. The title defaults to the
/// URI. When `parse_name` captures a group from the URI it becomes the name,
/// otherwise the name is the title. Lines without an http(s) URI yield `None`.
pub fn split_name(parse_name: Option<&Regex>, source: &str) -> Option<(String, String, String)> {
    let source = source.trim();
    static SCHEME: OnceLock<Regex> = OnceLock::new();
    let scheme = SCHEME.get_or_init(|| Regex::new("https?://").unwrap());
    let found = scheme.find(source)?;

    let (uri, mut title) = if found.start() == 0 {
        match source.split_once(' ') {
            Some((uri, title)) => (uri.trim().to_string(), title.trim().to_string()),
            None => (source.to_string(), String::new()),
        }
    } else {
        (
            source[found.start()..].trim().to_string(),
            source[..found.start()].trim().to_string(),
        )
    };
    if title.is_empty() {
        title = uri.clone();
    }

    let name = parse_name
        .and_then(|re| re.captures(&uri))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| title.clone());

    Some((uri, name, title))
}

/// Build streams from lines of the config file.
pub fn local_streams<S: AsRef<str>>(
    lines: &[S],
    stream_type: StreamType,
    group: &str,
    parse_name: Option<&Regex>,
) -> Vec<Stream> {
    let mut streams: Vec<Stream> = Vec::with_capacity(lines.len());
    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match split_name(parse_name, line) {
            Some((uri, name, title)) => {
                let stream = Stream::new(&uri, stream_type, &name, &title, group);
                // The key is the URI hash, so a repeated URI is the same stream.
                if !streams.iter().any(|s| s.key == stream.key) {
                    streams.push(stream);
                }
            }
            None => tracing::warn!("Sources: no http(s) URI in line {:?} of group {}", line, group),
        }
    }
    streams
}

/// Fetch a remote list with one stream per line.
pub async fn fetch_remote_streams(
    uri: &str,
    auth: Option<(&str, Option<&str>)>,
    stream_type: StreamType,
    group: &str,
    parse_name: Option<&Regex>,
) -> Result<Vec<Stream>, ConfigError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(20))
        .build()?;

    let mut request = client.get(uri);
    if let Some((user, pass)) = auth {
        request = request.basic_auth(user, pass);
    }

    let body = request.send().await?.error_for_status()?.text().await?;
    let lines: Vec<&str> = body.lines().collect();
    let streams = local_streams(&lines, stream_type, group, parse_name);
    tracing::info!("Sources: loaded {} streams for group {} from {}", streams.len(), group, uri);
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::{routing::get, Router};

    #[test]
    fn test_split_uri_first() {
        let (uri, name, title) = split_name(None, "  http://a.tv/x.m3u8 Channel One ").unwrap();
        assert_eq!(uri, "http://a.tv/x.m3u8");
        assert_eq!(title, "Channel One");
        assert_eq!(name, "Channel One");
    }

    #[test]
    fn test_split_title_first() {
        let (uri, name, title) = split_name(None, "Channel One https://a.tv/x.m3u8").unwrap();
        assert_eq!(uri, "https://a.tv/x.m3u8");
        assert_eq!(title, "Channel One");
        assert_eq!(name, "Channel One");
    }

    #[test]
    fn test_split_defaults_and_regex() {
        let (uri, name, title) = split_name(None, "http://a.tv/x.m3u8").unwrap();
        assert_eq!(title, uri);
        assert_eq!(name, uri);

        let re = Regex::new(r"/live/([^/]+)/").unwrap();
        let (_, name, _) = split_name(Some(&re), "http://a.tv/live/sport/index.m3u8").unwrap();
        assert_eq!(name, "sport");
        let (_, name, _) = split_name(Some(&re), "News http://a.tv/vod/index.m3u8").unwrap();
        assert_eq!(name, "News");

        assert!(split_name(None, "rtmp://a.tv/x").is_none());
    }

    #[test]
    fn test_local_streams_skip_noise() {
        let lines = ["# comment", "", "http://a/1", "garbage", "http://a/1 again", "Two http://a/2"];
        let streams = local_streams(&lines, StreamType::Http, "g", None);
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[1].title, "Two");
        assert_eq!(streams[1].group, "g");
    }

    #[tokio::test]
    async fn test_fetch_remote_streams() {
        let router = Router::new().route("/list", get(|| async { "One http://a/1\nhttp://a/2 Two\n" }));
        let addr = serve(router).await;
        let streams = fetch_remote_streams(&format!("http://{addr}/list"), None, StreamType::Hls, "remote", None)
            .await
            .unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].stream_type, StreamType::Hls);
        assert_eq!(streams[1].name, "Two");
    }
}
