//! Client for a network video recorder's HTTP/XML control plane.
//!
//! Speaks the recorder's ISAPI dialect over HTTPS with hand-rolled Digest
//! authentication: recording search, clip download, device introspection,
//! snapshots and reachability checks. Wire compatibility matters more than
//! elegance here: the firmware's XML parser is strict, down to a misspelled
//! tag it insists on.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::StreamExt;
use reqwest::{Method, StatusCode, header};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

mod auth;
mod xml;

const DEVICE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
pub enum Error {
    /// Network-level failure; the device may come back, retry later.
    Transport(reqwest::Error),
    /// Credentials rejected (or no usable challenge); fix configuration.
    Auth(String),
    /// The device answered with an unexpected status code.
    Status(StatusCode, String),
    /// The device answered with a body we could not make sense of.
    Parse(String),
    /// Local filesystem failure while persisting a download.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(err) => write!(f, "transport error: {}", err),
            Error::Auth(msg) => write!(f, "authentication failed: {}", msg),
            Error::Status(code, body) => write!(f, "device returned {}: {}", code, body),
            Error::Parse(msg) => write!(f, "unexpected device response: {}", msg),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One recording found on the recorder. Ephemeral: produced by [`Client::search`]
/// and consumed immediately by the download step.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub source_id: String,
    pub track_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub playback_uri: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeviceInfo {
    pub device_name: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub channels: usize,
}

pub struct Client {
    ip: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(ip: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Client {
            ip: ip.into(),
            username: username.into(),
            password: password.into(),
            http: reqwest::Client::builder()
                // Recorder certs are self-signed.
                .danger_accept_invalid_certs(true)
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("https://{}{}", self.ip, path)
    }

    /// Checks if the device is reachable. Any HTTP response, 401 and 403
    /// included, means the recorder is online; only transport errors fail.
    pub async fn ping(&self) -> Result<()> {
        let _ = self.http.get(self.url("/ISAPI/System/status")).send().await?;
        Ok(())
    }

    /// Fetches authenticated device info. Unlike [`Client::ping`] this
    /// verifies that the credentials are correct.
    pub async fn device_info(&self) -> Result<DeviceInfo> {
        let resp = self
            .do_digest(Method::GET, "/ISAPI/System/deviceInfo", None, None)
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Status(status, body));
        }

        if xml::text(&body, "DeviceInfo").is_none() {
            return Err(Error::Parse(format!("no DeviceInfo element in: {}", body)));
        }
        let mut info = DeviceInfo {
            device_name: xml::text(&body, "deviceName").unwrap_or_default().to_string(),
            model: xml::text(&body, "model").unwrap_or_default().to_string(),
            serial_number: xml::text(&body, "serialNumber").unwrap_or_default().to_string(),
            firmware_version: xml::text(&body, "firmwareVersion")
                .unwrap_or_default()
                .to_string(),
            channels: 0,
        };

        // Channel count is best-effort; older firmware lacks the endpoint.
        match self
            .do_digest(Method::GET, "/ISAPI/System/Video/inputs/channels", None, None)
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                if let Ok(body) = resp.text().await {
                    info.channels = xml::blocks(&body, "VideoInputChannel").len();
                }
            }
            Ok(_) => {}
            Err(err) => debug!("channel listing unavailable: {}", err),
        }

        Ok(info)
    }

    /// Fetches a JPEG snapshot from the given channel.
    pub async fn snapshot(&self, channel: i64) -> Result<Vec<u8>> {
        let path = format!("/ISAPI/Streaming/channels/{}01/picture", channel);
        let resp = self.do_digest(Method::GET, &path, None, None).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Status(status, resp.text().await.unwrap_or_default()));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Searches the recorder for recordings on a channel within a time range.
    /// A malformed or empty result list is an empty vec, not an error.
    pub async fn search(
        &self,
        channel: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Recording>> {
        let body = search_body(channel, start, end);
        let resp = self
            .do_digest(Method::POST, "/ISAPI/ContentMgmt/search", Some(body), None)
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Status(status, body));
        }
        Ok(parse_search_results(&body))
    }

    /// Downloads a recording to `dest`, streaming through `<dest>.tmp` and
    /// renaming into place only on full success. A failed or interrupted
    /// download never leaves a file at the final path.
    pub async fn download(&self, playback_uri: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let body = format!(
            "<downloadRequest><playbackURI>{}</playbackURI></downloadRequest>",
            xml::escape_amp(playback_uri)
        );
        let resp = self
            .do_digest(
                Method::POST,
                "/ISAPI/ContentMgmt/download",
                Some(body),
                Some(DOWNLOAD_TIMEOUT),
            )
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Status(status, resp.text().await.unwrap_or_default()));
        }

        let tmp = tmp_path_for(dest);
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }

    /// Performs a request with Digest Authentication: one unauthenticated
    /// attempt, then a single authenticated retry on a 401 challenge. A
    /// second 401 surfaces as [`Error::Auth`].
    async fn do_digest(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let url = self.url(path);

        // First attempt goes out without the body; it exists to collect the
        // challenge.
        let mut probe = self.http.request(method.clone(), &url);
        if let Some(t) = timeout {
            probe = probe.timeout(t);
        }
        let resp = probe.send().await?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            // No auth in play; replay with the body if we held one back.
            if let Some(body) = body {
                let mut req = self
                    .http
                    .request(method, &url)
                    .header(header::CONTENT_TYPE, "application/xml")
                    .body(body);
                if let Some(t) = timeout {
                    req = req.timeout(t);
                }
                return Ok(req.send().await?);
            }
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Auth("no WWW-Authenticate header in 401 response".to_string()))?
            .to_string();

        let authorization =
            auth::authorization_header(&self.username, &self.password, method.as_str(), path, &challenge)?;

        let mut req = self
            .http
            .request(method, &url)
            .header(header::AUTHORIZATION, authorization);
        if let Some(body) = body {
            req = req.header(header::CONTENT_TYPE, "application/xml").body(body);
        }
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = req.send().await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            warn!("recorder {} rejected digest credentials", self.ip);
            return Err(Error::Auth("check username and password".to_string()));
        }
        Ok(resp)
    }
}

/// Builds the recorder's RTSP URL for a channel relayed through the recorder.
/// `stream_type`: 1 = main stream (high res), 2 = sub stream (low res).
pub fn rtsp_url(
    ip: &str,
    rtsp_port: u16,
    username: &str,
    password: &str,
    channel: i64,
    stream_type: u8,
) -> String {
    format!(
        "rtsp://{}:{}@{}:{}/Streaming/Channels/{}0{}",
        username, password, ip, rtsp_port, channel, stream_type
    )
}

/// The search request body the firmware accepts: no XML declaration, no
/// namespace, a curly-brace UUID search id, and the misspelled
/// `searchResultPostion` tag preserved verbatim.
fn search_body(channel: i64, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let track_id = channel * 100 + 1;
    format!(
        "<CMSearchDescription>\n\
         <searchID>{{{}}}</searchID>\n\
         <trackIDList>\n\
         <trackID>{}</trackID>\n\
         </trackIDList>\n\
         <timeSpanList>\n\
         <timeSpan>\n\
         <startTime>{}</startTime>\n\
         <endTime>{}</endTime>\n\
         </timeSpan>\n\
         </timeSpanList>\n\
         <maxResults>500</maxResults>\n\
         <searchResultPostion>0</searchResultPostion>\n\
         <metadataList>\n\
         <metadataDescriptor>//recordType.meta.std-cgi.com</metadataDescriptor>\n\
         </metadataList>\n\
         </CMSearchDescription>",
        Uuid::new_v4().to_string().to_uppercase(),
        track_id,
        start.format(DEVICE_TIME_FORMAT),
        end.format(DEVICE_TIME_FORMAT),
    )
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.to_path_buf();
    if let Some(ext) = path.extension() {
        let mut ext = ext.to_os_string();
        ext.push(".tmp");
        tmp.set_extension(ext);
    } else {
        tmp.set_extension("tmp");
    }
    tmp
}

fn parse_device_time(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, DEVICE_TIME_FORMAT)
        .map(|t| t.and_utc())
        .unwrap_or_else(|_| DateTime::UNIX_EPOCH)
}

fn parse_search_results(body: &str) -> Vec<Recording> {
    xml::blocks(body, "searchMatchItem")
        .into_iter()
        .map(|item| {
            let span = xml::text(item, "timeSpan").unwrap_or_default();
            Recording {
                source_id: xml::text(item, "sourceID").unwrap_or_default().to_string(),
                track_id: xml::text(item, "trackID")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default(),
                start_time: parse_device_time(xml::text(span, "startTime").unwrap_or_default()),
                end_time: parse_device_time(xml::text(span, "endTime").unwrap_or_default()),
                playback_uri: xml::text(item, "playbackURI")
                    .map(xml::unescape_amp)
                    .unwrap_or_default(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn search_body_matches_firmware_expectations() {
        let start = Utc.with_ymd_and_hms(2026, 2, 18, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 18, 23, 59, 59).unwrap();
        let body = search_body(4, start, end);

        assert!(!body.contains("<?xml"), "firmware rejects an XML declaration");
        assert!(body.starts_with("<CMSearchDescription>"));
        assert!(body.contains("<trackID>401</trackID>"));
        assert!(body.contains("<startTime>2026-02-18T00:00:00Z</startTime>"));
        assert!(body.contains("<endTime>2026-02-18T23:59:59Z</endTime>"));
        assert!(body.contains("<searchResultPostion>0</searchResultPostion>"));
        assert!(body.contains("<maxResults>500</maxResults>"));

        let search_id = xml::text(&body, "searchID").unwrap();
        assert!(search_id.starts_with('{') && search_id.ends_with('}'));
        assert_eq!(search_id.len(), 38);
    }

    #[test]
    fn parse_search_results_reads_matches() {
        let body = r#"<CMSearchResult version="2.0" xmlns="http://www.std-cgi.com/ver20/XMLSchema">
<responseStatus>true</responseStatus>
<numOfMatches>2</numOfMatches>
<matchList>
<searchMatchItem>
<sourceID>{AAAA}</sourceID>
<trackID>401</trackID>
<timeSpan>
<startTime>2026-02-18T08:00:00Z</startTime>
<endTime>2026-02-18T09:00:00Z</endTime>
</timeSpan>
<mediaSegmentDescriptor>
<contentType>video</contentType>
<playbackURI>rtsp://10.0.0.2/Streaming/tracks/401?starttime=20260218T080000Z&amp;endtime=20260218T090000Z</playbackURI>
</mediaSegmentDescriptor>
</searchMatchItem>
<searchMatchItem>
<sourceID>{BBBB}</sourceID>
<trackID>401</trackID>
<timeSpan>
<startTime>2026-02-18T09:00:00Z</startTime>
<endTime>2026-02-18T10:00:00Z</endTime>
</timeSpan>
<mediaSegmentDescriptor>
<playbackURI>rtsp://10.0.0.2/Streaming/tracks/401?starttime=20260218T090000Z</playbackURI>
</mediaSegmentDescriptor>
</searchMatchItem>
</matchList>
</CMSearchResult>"#;

        let recordings = parse_search_results(body);
        assert_eq!(recordings.len(), 2);
        assert_eq!(recordings[0].track_id, 401);
        assert_eq!(
            recordings[0].playback_uri,
            "rtsp://10.0.0.2/Streaming/tracks/401?starttime=20260218T080000Z&endtime=20260218T090000Z"
        );
        assert_eq!(
            recordings[0].start_time,
            Utc.with_ymd_and_hms(2026, 2, 18, 8, 0, 0).unwrap()
        );
        assert_eq!(recordings[1].source_id, "{BBBB}");
    }

    #[test]
    fn parse_search_results_tolerates_empty_and_malformed_bodies() {
        assert!(parse_search_results("").is_empty());
        assert!(parse_search_results("<CMSearchResult></CMSearchResult>").is_empty());
        assert!(parse_search_results("not xml at all").is_empty());
    }

    #[test]
    fn rtsp_url_encodes_channel_and_stream_type() {
        assert_eq!(
            rtsp_url("10.0.0.2", 554, "admin", "pw", 4, 2),
            "rtsp://admin:pw@10.0.0.2:554/Streaming/Channels/402"
        );
    }
}
