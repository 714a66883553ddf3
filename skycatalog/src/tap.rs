//! Gaia queries over the IVOA Table Access Protocol.
//!
//! Queries are submitted as asynchronous UWS jobs (`POST {base}/async`),
//! waited on through `GET {base}/async/{id}/phase` and collected from
//! `GET {base}/async/{id}/results/result` in the TAP JSON serialization:
//!
//! ```text
//! {"metadata": [{"name": "source_id", ...}, ...], "data": [[...], ...]}
//! ```

use log::{debug, info, warn};
use regex::Regex;
use serde::Deserialize;
use skywcs::SkyCoord;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::CatalogError;
use crate::job::{wait_for_completion, CancelToken, JobPhase, WaitPolicy};
use crate::polygon::SkyPolygon;
use crate::source::CatalogSource;
use crate::star::CatalogStar;

/// ESA Gaia archive TAP endpoint.
pub const GAIA_TAP_URL: &str = "https://gea.esac.esa.int/tap-server/tap";

/// Default source table.
pub const GAIA_SOURCE_TABLE: &str = "gaiaedr3.gaia_source";

const COLUMNS: &str = "source_id, ra, dec, phot_g_mean_mag, phot_rp_mean_mag";

static JOB_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<uws:jobId>\s*([^<\s]+)\s*</uws:jobId>").expect("valid jobId pattern")
});

/// Transport for asynchronous TAP jobs.
pub trait TapService {
    /// Submit `adql` as a running job and return its identifier.
    fn submit(&self, adql: &str) -> Result<String, CatalogError>;

    fn phase(&self, job_id: &str) -> Result<JobPhase, CatalogError>;

    /// The job's result document in TAP JSON format.
    fn result(&self, job_id: &str) -> Result<String, CatalogError>;
}

impl<T: TapService + ?Sized> TapService for &T {
    fn submit(&self, adql: &str) -> Result<String, CatalogError> {
        (**self).submit(adql)
    }

    fn phase(&self, job_id: &str) -> Result<JobPhase, CatalogError> {
        (**self).phase(job_id)
    }

    fn result(&self, job_id: &str) -> Result<String, CatalogError> {
        (**self).result(job_id)
    }
}

/// [`TapService`] over HTTP.
pub struct HttpTapService {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpTapService {
    pub fn new(base_url: impl Into<String>) -> Self {
        // Redirects are handled by hand: the job location is the answer to
        // the submission.
        let config = ureq::Agent::config_builder()
            .max_redirects(0)
            .max_redirects_will_error(false)
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(60)))
            .build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent: ureq::Agent::new_with_config(config),
        }
    }

    pub fn gaia() -> Self {
        Self::new(GAIA_TAP_URL)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn job_url(&self, job_id: &str, suffix: &str) -> String {
        format!("{}/async/{}/{}", self.base_url, job_id, suffix)
    }

    fn get_text(&self, url: &str) -> Result<String, CatalogError> {
        debug!("GET {}", url);
        let response = self.agent.get(url).call()?;
        read_body(response)
    }
}

fn read_body(response: ureq::http::Response<ureq::Body>) -> Result<String, CatalogError> {
    let status = response.status();
    let body = response
        .into_body()
        .read_to_string()
        .map_err(|e| CatalogError::InvalidResponse(e.to_string()))?;
    if status.is_client_error() || status.is_server_error() {
        return Err(CatalogError::Status {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        });
    }
    Ok(body)
}

impl TapService for HttpTapService {
    fn submit(&self, adql: &str) -> Result<String, CatalogError> {
        let url = format!("{}/async", self.base_url);
        debug!("POST {}", url);
        let response = self.agent.post(&url).send_form([
            ("REQUEST", "doQuery"),
            ("LANG", "ADQL"),
            ("FORMAT", "json"),
            ("PHASE", "RUN"),
            ("QUERY", adql),
        ])?;

        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_body(response)?;
        match location {
            Some(location) => job_id_from_location(&location),
            None => job_id_from_document(&body),
        }
    }

    fn phase(&self, job_id: &str) -> Result<JobPhase, CatalogError> {
        let text = self.get_text(&self.job_url(job_id, "phase"))?;
        Ok(JobPhase::parse(&text))
    }

    fn result(&self, job_id: &str) -> Result<String, CatalogError> {
        self.get_text(&self.job_url(job_id, "results/result"))
    }
}

/// Job identifier from a `Location: .../async/{id}` header.
pub fn job_id_from_location(location: &str) -> Result<String, CatalogError> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty() && !location.ends_with("/async"))
        .map(str::to_string)
        .ok_or_else(|| CatalogError::InvalidResponse(format!("no job id in {location:?}")))
}

/// Job identifier from a UWS job document (`<uws:jobId>...</uws:jobId>`).
pub fn job_id_from_document(document: &str) -> Result<String, CatalogError> {
    JOB_ID_PATTERN
        .captures(document)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| CatalogError::InvalidResponse("no uws:jobId in job document".to_string()))
}

#[derive(Debug, Deserialize)]
struct TapColumn {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TapTable {
    metadata: Vec<TapColumn>,
    data: Vec<Vec<serde_json::Value>>,
}

/// Decode a TAP JSON result into catalog stars, keeping row order.
pub fn parse_tap_json(body: &str) -> Result<Vec<CatalogStar>, CatalogError> {
    let table: TapTable =
        serde_json::from_str(body).map_err(|e| CatalogError::InvalidResponse(e.to_string()))?;

    let column = |name: &str| {
        table
            .metadata
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    };
    let require = |name: &str| {
        column(name).ok_or_else(|| CatalogError::InvalidResponse(format!("missing column {name}")))
    };
    let id_col = require("source_id")?;
    let ra_col = require("ra")?;
    let dec_col = require("dec")?;
    let g_col = require("phot_g_mean_mag")?;
    let rp_col = column("phot_rp_mean_mag");

    let mut stars = Vec::with_capacity(table.data.len());
    for (row_index, row) in table.data.iter().enumerate() {
        let bad_row = |what: &str| {
            CatalogError::InvalidResponse(format!("row {row_index}: invalid {what}"))
        };
        let id = row
            .get(id_col)
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| bad_row("source_id"))?;
        let ra = row
            .get(ra_col)
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| bad_row("ra"))?;
        let dec = row
            .get(dec_col)
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| bad_row("dec"))?;
        let magnitude = |col: Option<usize>| {
            col.and_then(|c| row.get(c))
                .and_then(serde_json::Value::as_f64)
                .map_or(f32::NAN, |m| m as f32)
        };
        stars.push(CatalogStar::new(
            id,
            ra,
            dec,
            magnitude(Some(g_col)),
            magnitude(rp_col),
        ));
    }
    Ok(stars)
}

/// Gaia source catalog behind a [`TapService`].
pub struct GaiaCatalog<S = HttpTapService> {
    service: S,
    table: String,
    wait: WaitPolicy,
    cancel: CancelToken,
}

impl GaiaCatalog<HttpTapService> {
    /// The public ESA archive.
    pub fn esa() -> Self {
        Self::new(HttpTapService::gaia())
    }
}

impl<S: TapService> GaiaCatalog<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            table: GAIA_SOURCE_TABLE.to_string(),
            wait: WaitPolicy::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// ADQL for the brightest `max_count` sources inside `polygon`.
    pub fn polygon_query(&self, polygon: &SkyPolygon, mag_limit: f64, max_count: usize) -> String {
        format!(
            "SELECT TOP {max_count} {COLUMNS} FROM {} \
             WHERE phot_g_mean_mag < {mag_limit} \
             AND 1=CONTAINS(POINT('ICRS', ra, dec), {}) \
             ORDER BY phot_g_mean_mag",
            self.table,
            polygon.to_adql()
        )
    }

    /// ADQL for the brightest `max_count` sources within `fov_deg / 2` of
    /// `center`, optionally magnitude limited.
    pub fn cone_query(
        &self,
        center: &SkyCoord,
        fov_deg: f64,
        max_count: usize,
        mag_limit: Option<f64>,
    ) -> String {
        let magnitude = mag_limit
            .map(|m| format!("phot_g_mean_mag < {m} AND "))
            .unwrap_or_default();
        format!(
            "SELECT TOP {max_count} {COLUMNS} FROM {} \
             WHERE {magnitude}1=CONTAINS(POINT('ICRS', ra, dec), \
             CIRCLE('ICRS', {:.8}, {:.8}, {})) \
             ORDER BY phot_g_mean_mag",
            self.table,
            center.ra,
            center.dec,
            fov_deg / 2.0
        )
    }

    pub fn query_cone(
        &self,
        center: &SkyCoord,
        fov_deg: f64,
        max_count: usize,
        mag_limit: Option<f64>,
    ) -> Result<Vec<CatalogStar>, CatalogError> {
        if !(fov_deg > 0.0 && fov_deg.is_finite()) {
            return Err(CatalogError::InvalidQuery(format!(
                "field of view must be positive, got {fov_deg}"
            )));
        }
        if max_count == 0 {
            return Ok(Vec::new());
        }
        self.run(&self.cone_query(center, fov_deg, max_count, mag_limit))
    }

    /// Submit `adql`, wait for the job and decode its result.
    pub fn run(&self, adql: &str) -> Result<Vec<CatalogStar>, CatalogError> {
        debug!("ADQL: {}", adql);
        let job_id = self.service.submit(adql)?;
        info!("submitted catalog job {}", job_id);

        let phase = wait_for_completion(|| self.service.phase(&job_id), &self.wait, &self.cancel)?;
        if phase != JobPhase::Completed {
            warn!("catalog job {} ended in phase {}", job_id, phase);
            return Err(CatalogError::JobFailed { job_id, phase });
        }

        let stars = parse_tap_json(&self.service.result(&job_id)?)?;
        info!("catalog job {} returned {} stars", job_id, stars.len());
        Ok(stars)
    }
}

impl<S: TapService> CatalogSource for GaiaCatalog<S> {
    fn query_polygon(
        &self,
        polygon: &SkyPolygon,
        mag_limit: f64,
        max_count: usize,
    ) -> Result<Vec<CatalogStar>, CatalogError> {
        if !mag_limit.is_finite() {
            return Err(CatalogError::InvalidQuery(format!(
                "magnitude limit must be finite, got {mag_limit}"
            )));
        }
        if max_count == 0 {
            return Ok(Vec::new());
        }
        self.run(&self.polygon_query(polygon, mag_limit, max_count))
    }
}
