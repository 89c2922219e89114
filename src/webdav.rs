//! WebDAV implementation of the remote-store interface.
//!
//! PROPFIND with depth 1 backs the listing; uploads and downloads stream
//! through PUT/GET bodies. Missing parents are created with MKCOL (a 405
//! means the collection already exists).

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use futures_util::TryStreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, StatusCode};
use tokio_util::io::{ReaderStream, StreamReader};
use url::Url;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::remote::{RemoteClient, RemoteEntry, RemoteReader};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:">
    <D:prop>
        <D:resourcetype/>
        <D:getcontentlength/>
        <D:getlastmodified/>
    </D:prop>
</D:propfind>"#;

#[derive(Debug, Clone)]
pub struct WebDavClient {
    http: reqwest::Client,
    base: Url,
    user: String,
    pass: String,
}

impl WebDavClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let base = Url::parse(&config.url)?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base,
            user: config.user.clone(),
            pass: config.pass.clone(),
        })
    }

    fn url_for(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.user, Some(&self.pass))
    }

    fn propfind_method() -> Result<Method> {
        Method::from_bytes(b"PROPFIND").map_err(|e| Error::Network(e.to_string()))
    }

    fn mkcol_method() -> Result<Method> {
        Method::from_bytes(b"MKCOL").map_err(|e| Error::Network(e.to_string()))
    }

    /// Create the missing parent collections of `path`, inside-out.
    async fn ensure_parents(&self, path: &str) -> Result<()> {
        let trimmed = path.trim_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.len() < 2 {
            return Ok(());
        }
        let mut dir = String::new();
        for segment in &segments[..segments.len() - 1] {
            dir.push('/');
            dir.push_str(segment);
            let response = self
                .request(Self::mkcol_method()?, self.url_for(&dir))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() && status != StatusCode::METHOD_NOT_ALLOWED {
                return Err(Error::Network(format!(
                    "MKCOL {dir} failed: {status}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for WebDavClient {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let url = self.url_for(path);
        let response = self
            .request(Self::propfind_method()?, url.clone())
            .header("Depth", "1")
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("PROPFIND {url} failed: {status}")));
        }
        let body = response.text().await?;
        let entries = parse_multistatus(&body)?
            .into_iter()
            .filter(|r| !r.is_collection)
            .filter_map(|r| {
                let name = entry_name(&r.href)?;
                Some(RemoteEntry {
                    name,
                    mtime: r.mtime,
                })
            })
            .collect();
        Ok(entries)
    }

    async fn read_stream(&self, path: &str) -> Result<RemoteReader> {
        let url = self.url_for(path);
        let response = self.request(Method::GET, url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("GET {url} failed: {status}")));
        }
        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn write_stream(&self, path: &str, data: RemoteReader, _mode: u32) -> Result<()> {
        self.ensure_parents(path).await?;
        let url = self.url_for(path);
        let body = reqwest::Body::wrap_stream(ReaderStream::new(data));
        let response = self
            .request(Method::PUT, url.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("PUT {url} failed: {status}")));
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let url = self.url_for(path);
        let response = self.request(Method::DELETE, url.clone()).send().await?;
        let status = response.status();
        // A target that is already gone counts as removed.
        if status.is_success()
            || status == StatusCode::NOT_FOUND
            || status == StatusCode::GONE
        {
            Ok(())
        } else {
            Err(Error::Network(format!("DELETE {url} failed: {status}")))
        }
    }
}

#[derive(Debug, Default)]
struct MultistatusEntry {
    href: String,
    mtime: i64,
    is_collection: bool,
}

/// Pull href, getlastmodified and the collection flag out of a multistatus
/// body, tolerating arbitrary namespace prefixes.
fn parse_multistatus(body: &str) -> Result<Vec<MultistatusEntry>> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(body);
    let mut entries = Vec::new();
    let mut current = MultistatusEntry::default();
    let mut lastmod = String::new();
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"response" => {
                    current = MultistatusEntry::default();
                    lastmod.clear();
                }
                b"href" => field = Some("href"),
                b"getlastmodified" => field = Some("lastmod"),
                b"collection" => current.is_collection = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    current.is_collection = true;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::Network(format!("bad multistatus: {e}")))?;
                match field {
                    Some("href") => current.href.push_str(&text),
                    Some("lastmod") => lastmod.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"href" | b"getlastmodified" => field = None,
                b"response" => {
                    current.mtime = parse_http_date(lastmod.trim());
                    entries.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::Network(format!("bad multistatus: {e}")));
            }
        }
    }
    Ok(entries)
}

/// `getlastmodified` is an HTTP date (RFC 2822 shape); 0 when absent or
/// unparseable.
fn parse_http_date(value: &str) -> i64 {
    if value.is_empty() {
        return 0;
    }
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

/// Final path segment of a decoded href; `None` for the collection itself.
fn entry_name(href: &str) -> Option<String> {
    let decoded = urlencoding::decode(href).ok()?;
    let name = decoded.trim_end_matches('/').rsplit('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn client() -> WebDavClient {
        WebDavClient::new(&SyncConfig {
            url: "https://dav.example.com/remote.php/dav".into(),
            user: "alice".into(),
            pass: "secret".into(),
            local_dir: PathBuf::from("/tmp/sync"),
            remote_dir: "/backup".into(),
            mode: Default::default(),
        })
        .unwrap()
    }

    #[test]
    fn urls_join_under_the_endpoint_path() {
        let client = client();
        assert_eq!(
            client.url_for("/backup/a.txt").as_str(),
            "https://dav.example.com/remote.php/dav/backup/a.txt"
        );
        assert_eq!(
            client.url_for("backup/docs/b c.txt").as_str(),
            "https://dav.example.com/remote.php/dav/backup/docs/b%20c.txt"
        );
    }

    #[test]
    fn multistatus_listing_extracts_files_with_mtimes() {
        let body = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/remote.php/dav/backup/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/backup/a.txt</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>5</d:getcontentlength>
        <d:getlastmodified>Fri, 01 Aug 2025 10:00:00 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/backup/b%20c.txt</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getlastmodified>Fri, 01 Aug 2025 11:30:00 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

        let entries = parse_multistatus(body).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_collection);

        let files: Vec<_> = entries
            .into_iter()
            .filter(|e| !e.is_collection)
            .map(|e| (entry_name(&e.href).unwrap(), e.mtime))
            .collect();
        assert_eq!(files[0].0, "a.txt");
        assert!(files[0].1 > 0);
        assert_eq!(files[1].0, "b c.txt");
        assert!(files[1].1 > files[0].1);
    }

    #[test]
    fn uppercase_dav_prefixes_parse_too() {
        let body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/backup/x.bin</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype/>
        <D:getlastmodified>Tue, 01 Jul 2025 00:00:00 GMT</D:getlastmodified>
      </D:prop>
    </D:propstat>
  </D:response>
</D:multistatus>"#;
        let entries = parse_multistatus(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_collection);
        assert_eq!(entry_name(&entries[0].href).as_deref(), Some("x.bin"));
        assert_eq!(entries[0].mtime, 1751328000);
    }

    #[test]
    fn http_dates_fall_back_to_zero() {
        assert_eq!(parse_http_date(""), 0);
        assert_eq!(parse_http_date("not a date"), 0);
        assert!(parse_http_date("Fri, 01 Aug 2025 10:00:00 GMT") > 0);
    }
}
