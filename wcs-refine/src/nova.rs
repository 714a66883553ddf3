//! Blind plate solving through the astrometry.net web API.
//!
//! Star centroids are uploaded as a FITS `xylist` (a binary table with `X`
//! and `Y` columns in one-based pixels) and solved on the server:
//!
//! 1. `POST {server}/api/login` exchanges the API key for a session
//! 2. `POST {server}/api/upload` submits the list with the image size
//! 3. `GET {server}/api/submissions/{id}` until a job is attached
//! 4. `GET {server}/api/jobs/{id}` until the job reports `success` or `failure`
//! 5. `GET {server}/wcs_file/{id}` returns the solution as a FITS header
//!
//! Both waits go through [`wait_for_completion`], so they honour the
//! solver's [`WaitPolicy`] and [`CancelToken`].

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use skycatalog::{wait_for_completion, CancelToken, JobPhase, WaitPolicy};
use skywcs::{header_block, parse_header, HeaderCard, HeaderValue, ImageSize, TanWcs};
use std::time::Duration;

use crate::solver::{check_input, CoarseSolver, SolverError};

/// Public astrometry.net server.
pub const NOVA_URL: &str = "http://nova.astrometry.net";

const MULTIPART_BOUNDARY: &str = "wcs-refine-xylist-7d1f0c9a";
const FITS_BLOCK: usize = 2880;

/// Plate scale bounds to narrow the search, arcseconds per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleHint {
    pub lower_arcsec: f64,
    pub upper_arcsec: f64,
}

/// Search only within `radius_deg` of a position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionHint {
    pub ra: f64,
    pub dec: f64,
    pub radius_deg: f64,
}

/// Per-submission options sent with the upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NovaSettings {
    pub publicly_visible: bool,
    pub scale: Option<ScaleHint>,
    pub position: Option<PositionHint>,
    /// SIP order fitted by the server; only the linear part is used
    pub tweak_order: u32,
}

impl Default for NovaSettings {
    fn default() -> Self {
        Self {
            publicly_visible: false,
            scale: None,
            position: None,
            tweak_order: 2,
        }
    }
}

/// Star centroids of one image, zero-based pixels.
#[derive(Debug, Clone, Copy)]
pub struct SourceList<'a> {
    pub xs: &'a [f64],
    pub ys: &'a [f64],
    pub size: ImageSize,
}

/// Transport for astrometry.net submissions.
pub trait NovaService {
    /// Session key for `api_key`.
    fn login(&self, api_key: &str) -> Result<String, SolverError>;

    /// Upload `sources` and return the submission id.
    fn upload(
        &self,
        session: &str,
        sources: &SourceList<'_>,
        settings: &NovaSettings,
    ) -> Result<u64, SolverError>;

    /// The job started for a submission, once there is one.
    fn submission_job(&self, submission_id: u64) -> Result<Option<u64>, SolverError>;

    fn job_phase(&self, job_id: u64) -> Result<JobPhase, SolverError>;

    /// Raw FITS header of a solved job.
    fn wcs_header(&self, job_id: u64) -> Result<Vec<u8>, SolverError>;
}

impl<T: NovaService + ?Sized> NovaService for &T {
    fn login(&self, api_key: &str) -> Result<String, SolverError> {
        (**self).login(api_key)
    }

    fn upload(
        &self,
        session: &str,
        sources: &SourceList<'_>,
        settings: &NovaSettings,
    ) -> Result<u64, SolverError> {
        (**self).upload(session, sources, settings)
    }

    fn submission_job(&self, submission_id: u64) -> Result<Option<u64>, SolverError> {
        (**self).submission_job(submission_id)
    }

    fn job_phase(&self, job_id: u64) -> Result<JobPhase, SolverError> {
        (**self).job_phase(job_id)
    }

    fn wcs_header(&self, job_id: u64) -> Result<Vec<u8>, SolverError> {
        (**self).wcs_header(job_id)
    }
}

impl From<ureq::Error> for SolverError {
    fn from(error: ureq::Error) -> Self {
        match error {
            ureq::Error::Timeout(_) => SolverError::Timeout,
            other => SolverError::Service(other.to_string()),
        }
    }
}

/// [`NovaService`] over HTTP.
pub struct HttpNovaService {
    server_url: String,
    agent: ureq::Agent,
}

impl HttpNovaService {
    pub fn new(server_url: impl Into<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(120)))
            .build();
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            agent: ureq::Agent::new_with_config(config),
        }
    }

    pub fn nova() -> Self {
        Self::new(NOVA_URL)
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/{}", self.server_url, path)
    }

    fn get(&self, url: &str) -> Result<Vec<u8>, SolverError> {
        debug!("GET {}", url);
        read_reply(self.agent.get(url).call()?)
    }

    fn get_text(&self, url: &str) -> Result<String, SolverError> {
        String::from_utf8(self.get(url)?)
            .map_err(|e| SolverError::Service(format!("non-text reply from {url}: {e}")))
    }
}

fn read_reply(response: ureq::http::Response<ureq::Body>) -> Result<Vec<u8>, SolverError> {
    let status = response.status();
    let body = response.into_body().read_to_vec()?;
    if status.is_client_error() || status.is_server_error() {
        let message: String = String::from_utf8_lossy(&body).chars().take(200).collect();
        return Err(SolverError::Service(format!(
            "astrometry.net returned HTTP {}: {}",
            status.as_u16(),
            message
        )));
    }
    Ok(body)
}

impl NovaService for HttpNovaService {
    fn login(&self, api_key: &str) -> Result<String, SolverError> {
        let url = self.api("login");
        debug!("POST {}", url);
        let request = json!({ "apikey": api_key }).to_string();
        let response = self
            .agent
            .post(&url)
            .send_form([("request-json", request.as_str())])?;
        parse_login_reply(&String::from_utf8_lossy(&read_reply(response)?))
    }

    fn upload(
        &self,
        session: &str,
        sources: &SourceList<'_>,
        settings: &NovaSettings,
    ) -> Result<u64, SolverError> {
        let url = self.api("upload");
        let request = upload_request(session, sources.size, settings).to_string();
        let body = multipart_body(&request, &source_list_fits(sources.xs, sources.ys));
        debug!("POST {} ({} bytes)", url, body.len());
        let response = self
            .agent
            .post(&url)
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
            )
            .send(&body[..])?;
        parse_upload_reply(&String::from_utf8_lossy(&read_reply(response)?))
    }

    fn submission_job(&self, submission_id: u64) -> Result<Option<u64>, SolverError> {
        parse_submission(&self.get_text(&self.api(&format!("submissions/{submission_id}")))?)
    }

    fn job_phase(&self, job_id: u64) -> Result<JobPhase, SolverError> {
        parse_job_status(&self.get_text(&self.api(&format!("jobs/{job_id}")))?)
    }

    fn wcs_header(&self, job_id: u64) -> Result<Vec<u8>, SolverError> {
        self.get(&format!("{}/wcs_file/{}", self.server_url, job_id))
    }
}

/// The `request-json` form field of an upload.
pub fn upload_request(session: &str, size: ImageSize, settings: &NovaSettings) -> serde_json::Value {
    let flag = |on: bool| if on { "y" } else { "n" };
    let mut request = json!({
        "session": session,
        "publicly_visible": flag(settings.publicly_visible),
        "allow_commercial_use": "n",
        "allow_modifications": "n",
        "image_width": size.width,
        "image_height": size.height,
        "tweak_order": settings.tweak_order,
        "crpix_center": true,
    });
    if let Some(scale) = settings.scale {
        request["scale_units"] = json!("arcsecperpix");
        request["scale_type"] = json!("ul");
        request["scale_lower"] = json!(scale.lower_arcsec);
        request["scale_upper"] = json!(scale.upper_arcsec);
    }
    if let Some(position) = settings.position {
        request["center_ra"] = json!(position.ra);
        request["center_dec"] = json!(position.dec);
        request["radius"] = json!(position.radius_deg);
    }
    request
}

/// FITS file with an empty primary HDU and a two column (`X`, `Y`, double)
/// binary table of one-based pixel positions.
pub fn source_list_fits(xs: &[f64], ys: &[f64]) -> Vec<u8> {
    let logical = |key: &str, v: bool| HeaderCard::new(key, HeaderValue::Logical(v));
    let integer = |key: &str, v: i64| HeaderCard::new(key, HeaderValue::Integer(v));
    let text = |key: &str, v: &str| HeaderCard::new(key, HeaderValue::Text(v.to_string()));
    let rows = xs.len().min(ys.len());

    let primary = [
        logical("SIMPLE", true),
        integer("BITPIX", 8),
        integer("NAXIS", 0),
        logical("EXTEND", true),
    ];
    let table = [
        text("XTENSION", "BINTABLE"),
        integer("BITPIX", 8),
        integer("NAXIS", 2),
        integer("NAXIS1", 16),
        integer("NAXIS2", rows as i64),
        integer("PCOUNT", 0),
        integer("GCOUNT", 1),
        integer("TFIELDS", 2),
        text("TTYPE1", "X"),
        text("TFORM1", "D"),
        text("TTYPE2", "Y"),
        text("TFORM2", "D"),
    ];

    let mut bytes = header_block(&primary);
    bytes.extend(header_block(&table));
    let data_start = bytes.len();
    for (x, y) in xs.iter().zip(ys) {
        bytes.extend((x + 1.0).to_be_bytes());
        bytes.extend((y + 1.0).to_be_bytes());
    }
    let data_len = bytes.len() - data_start;
    bytes.resize(data_start + data_len.div_ceil(FITS_BLOCK) * FITS_BLOCK, 0);
    bytes
}

fn multipart_body(request_json: &str, file: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{MULTIPART_BOUNDARY}\r\n\
         Content-Type: text/plain\r\n\
         Content-Disposition: form-data; name=\"request-json\"\r\n\r\n\
         {request_json}\r\n\
         --{MULTIPART_BOUNDARY}\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"sources.xyls\"\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(file);
    body.extend(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").bytes());
    body
}

#[derive(Debug, Deserialize)]
struct Reply {
    status: String,
    #[serde(default)]
    errormessage: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    subid: Option<u64>,
}

fn parse_reply(body: &str) -> Result<Reply, SolverError> {
    let reply: Reply = serde_json::from_str(body)
        .map_err(|e| SolverError::Service(format!("invalid astrometry.net reply: {e}")))?;
    if reply.status != "success" {
        let reason = reply.errormessage.unwrap_or_else(|| reply.status.clone());
        return Err(SolverError::Service(format!("astrometry.net: {reason}")));
    }
    Ok(reply)
}

/// Session key from a `login` reply.
pub fn parse_login_reply(body: &str) -> Result<String, SolverError> {
    parse_reply(body)?
        .session
        .ok_or_else(|| SolverError::Service("login reply has no session".to_string()))
}

/// Submission id from an `upload` reply.
pub fn parse_upload_reply(body: &str) -> Result<u64, SolverError> {
    parse_reply(body)?
        .subid
        .ok_or_else(|| SolverError::Service("upload reply has no subid".to_string()))
}

/// First job of a submission status document (`{"jobs": [null]}` while queued).
pub fn parse_submission(body: &str) -> Result<Option<u64>, SolverError> {
    #[derive(Deserialize)]
    struct Submission {
        #[serde(default)]
        jobs: Vec<Option<u64>>,
    }
    let submission: Submission = serde_json::from_str(body)
        .map_err(|e| SolverError::Service(format!("invalid submission status: {e}")))?;
    Ok(submission.jobs.into_iter().flatten().next())
}

/// Job status (`solving`, `success`, `failure`) as a UWS-style phase.
pub fn parse_job_status(body: &str) -> Result<JobPhase, SolverError> {
    #[derive(Deserialize)]
    struct JobStatus {
        status: String,
    }
    let job: JobStatus = serde_json::from_str(body)
        .map_err(|e| SolverError::Service(format!("invalid job status: {e}")))?;
    Ok(match job.status.as_str() {
        "success" => JobPhase::Completed,
        "failure" => JobPhase::Error,
        "solving" => JobPhase::Executing,
        other => JobPhase::Unknown(other.to_string()),
    })
}

/// [`CoarseSolver`] backed by an astrometry.net server.
pub struct NovaSolver<S = HttpNovaService> {
    service: S,
    api_key: String,
    settings: NovaSettings,
    wait: WaitPolicy,
    cancel: CancelToken,
}

impl NovaSolver<HttpNovaService> {
    /// Solver using the public nova.astrometry.net server.
    pub fn nova(api_key: impl Into<String>) -> Self {
        Self::new(HttpNovaService::nova(), api_key)
    }
}

impl<S: NovaService> NovaSolver<S> {
    pub fn new(service: S, api_key: impl Into<String>) -> Self {
        Self {
            service,
            api_key: api_key.into(),
            settings: NovaSettings::default(),
            wait: WaitPolicy {
                poll_interval: Duration::from_secs(2),
                backoff: 1.5,
                max_interval: Duration::from_secs(10),
                timeout: Some(Duration::from_secs(300)),
            },
            cancel: CancelToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: NovaSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Applied separately to waiting for the job and waiting for its result.
    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &NovaSettings {
        &self.settings
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl<S: NovaService> CoarseSolver for NovaSolver<S> {
    fn solve(&self, xs: &[f64], ys: &[f64], size: ImageSize) -> Result<TanWcs, SolverError> {
        check_input(xs, ys, size)?;
        if xs.is_empty() {
            return Err(SolverError::InvalidInput("no sources to solve".to_string()));
        }

        let session = self.service.login(&self.api_key)?;
        let sources = SourceList { xs, ys, size };
        let submission = self.service.upload(&session, &sources, &self.settings)?;
        info!(
            "astrometry.net submission {} with {} sources in {}",
            submission,
            xs.len(),
            size
        );

        let mut job = None;
        wait_for_completion::<_, SolverError>(
            || {
                job = self.service.submission_job(submission)?;
                Ok(if job.is_some() {
                    JobPhase::Completed
                } else {
                    JobPhase::Queued
                })
            },
            &self.wait,
            &self.cancel,
        )?;
        let job_id = job.ok_or_else(|| {
            SolverError::Service(format!("submission {submission} started no job"))
        })?;
        debug!("submission {} is job {}", submission, job_id);

        let phase = wait_for_completion(
            || self.service.job_phase(job_id),
            &self.wait,
            &self.cancel,
        )?;
        if phase != JobPhase::Completed {
            warn!("astrometry.net job {} ended with {}", job_id, phase);
            return Err(SolverError::NoSolution(format!(
                "astrometry.net job {job_id} found no solution ({phase})"
            )));
        }

        let cards = parse_header(&self.service.wcs_header(job_id)?);
        let wcs = TanWcs::from_header_cards(&cards).map_err(|e| {
            SolverError::Service(format!("job {job_id} returned an unusable WCS: {e}"))
        })?;
        info!(
            "blind solution at {} ({:.3}\"/px, {:.2}°)",
            wcs.crval,
            wcs.pixel_scale_arcsec(),
            wcs.rotation_deg()
        );
        Ok(wcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_list_layout() {
        let bytes = source_list_fits(&[0.0, 99.5], &[10.0, 20.25]);
        assert_eq!(bytes.len(), 3 * FITS_BLOCK);

        let primary = parse_header(&bytes[..FITS_BLOCK]);
        assert_eq!(primary[0].keyword, "SIMPLE");
        let table = parse_header(&bytes[FITS_BLOCK..2 * FITS_BLOCK]);
        let value = |key: &str| skywcs::header::find_value(&table, key).cloned();
        assert_eq!(value("XTENSION"), Some(HeaderValue::Text("BINTABLE".into())));
        assert_eq!(value("NAXIS2"), Some(HeaderValue::Integer(2)));
        assert_eq!(value("TTYPE2"), Some(HeaderValue::Text("Y".into())));

        let data = &bytes[2 * FITS_BLOCK..];
        let read = |offset: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[offset..offset + 8]);
            f64::from_be_bytes(raw)
        };
        assert_eq!(read(0), 1.0);
        assert_eq!(read(8), 11.0);
        assert_eq!(read(16), 100.5);
        assert_eq!(read(24), 21.25);
        assert!(data[32..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_upload_request() {
        let size = ImageSize::from_width_height(4096, 3072);
        let request = upload_request("abc", size, &NovaSettings::default());
        assert_eq!(request["session"], "abc");
        assert_eq!(request["image_width"], 4096);
        assert_eq!(request["image_height"], 3072);
        assert_eq!(request["publicly_visible"], "n");
        assert!(request.get("scale_lower").is_none());

        let settings = NovaSettings {
            scale: Some(ScaleHint {
                lower_arcsec: 0.5,
                upper_arcsec: 2.0,
            }),
            position: Some(PositionHint {
                ra: 83.8,
                dec: -5.4,
                radius_deg: 1.0,
            }),
            ..Default::default()
        };
        let request = upload_request("abc", size, &settings);
        assert_eq!(request["scale_units"], "arcsecperpix");
        assert_eq!(request["scale_upper"], 2.0);
        assert_eq!(request["center_dec"], -5.4);
    }

    #[test]
    fn test_multipart_body_wraps_file() {
        let body = multipart_body("{\"session\":\"s\"}", b"FITSDATA");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with(&format!("--{MULTIPART_BOUNDARY}\r\n")));
        assert!(text.contains("name=\"request-json\"\r\n\r\n{\"session\":\"s\"}\r\n"));
        assert!(text.contains("filename=\"sources.xyls\"\r\n\r\nFITSDATA\r\n"));
        assert!(text.ends_with(&format!("--{MULTIPART_BOUNDARY}--\r\n")));
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(
            parse_login_reply(r#"{"status": "success", "message": "authenticated user: ", "session": "s3ss"}"#),
            Ok("s3ss".to_string())
        );
        assert_eq!(
            parse_login_reply(r#"{"status": "error", "errormessage": "bad apikey"}"#),
            Err(SolverError::Service("astrometry.net: bad apikey".to_string()))
        );
        assert_eq!(
            parse_upload_reply(r#"{"status": "success", "subid": 16714, "hash": "6024b45a"}"#),
            Ok(16714)
        );
        assert_eq!(
            parse_submission(r#"{"processing_started": "None", "jobs": [null]}"#),
            Ok(None)
        );
        assert_eq!(
            parse_submission(r#"{"jobs": [null, 12931465], "job_calibrations": []}"#),
            Ok(Some(12931465))
        );
        assert_eq!(parse_job_status(r#"{"status": "solving"}"#), Ok(JobPhase::Executing));
        assert_eq!(parse_job_status(r#"{"status": "success"}"#), Ok(JobPhase::Completed));
        assert_eq!(parse_job_status(r#"{"status": "failure"}"#), Ok(JobPhase::Error));
        assert!(parse_job_status("<html>").is_err());
    }
}
