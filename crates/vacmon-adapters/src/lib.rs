//! Upstream data sources: the ABC vacancy listing API and the oblea codes file.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use vacmon_core::{normalize_code, EligibilityCodes, VacancyRecord};

pub const CRATE_NAME: &str = "vacmon-adapters";

/// Solr `select` endpoint of the ABC teacher-valuation portal.
pub const DEFAULT_API_BASE_URL: &str =
    "https://servicios3.abc.gob.ar/valoracion.docente/api/apd.oferta.encabezado/select";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client")]
    Client(#[source] reqwest::Error),
    #[error("requesting {url}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected payload from {url}")]
    Payload {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct AbcClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub max_results: u32,
    /// The upstream government server still terminates TLS with a legacy
    /// stack; only enable when the default handshake fails.
    pub accept_invalid_certs: bool,
}

impl Default for AbcClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: "vacmon/0.1".to_string(),
            max_results: 500,
            accept_invalid_certs: false,
        }
    }
}

/// Client for the ABC vacancy listing API. One request per poll, no retries:
/// a failed fetch aborts the pass and the next scheduled invocation tries
/// again.
#[derive(Debug)]
pub struct AbcClient {
    http: reqwest::Client,
    config: AbcClientConfig,
}

impl AbcClient {
    pub fn new(config: AbcClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone());
        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build().map_err(FetchError::Client)?;
        Ok(Self { http, config })
    }

    /// Fetches currently published vacancies, restricted server-side to the
    /// requested districts and levels, soonest-closing offers first.
    pub async fn fetch_published(
        &self,
        districts: &[String],
        levels: &[String],
    ) -> Result<Vec<VacancyRecord>, FetchError> {
        let mut query: Vec<(&str, String)> = vec![
            ("q", "*:*".to_string()),
            ("wt", "json".to_string()),
            ("rows", self.config.max_results.to_string()),
            ("sort", "finoferta asc".to_string()),
        ];
        for fq in filter_queries(districts, levels) {
            query.push(("fq", fq));
        }

        let url = self.config.base_url.clone();
        info!(%url, districts = districts.len(), levels = levels.len(), "querying vacancy listing");

        let body = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?
            .text()
            .await
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;

        let records = parse_listing(&body, &url)?;
        info!(count = records.len(), "vacancies fetched");
        Ok(records)
    }
}

/// Solr `fq` clauses the way the upstream portal expects them: published
/// state, lowercased quoted district/level values OR-chained within each
/// filter.
pub fn filter_queries(districts: &[String], levels: &[String]) -> Vec<String> {
    let mut clauses = vec!["estado:Publicada".to_string()];
    if let Some(clause) = or_clause("descdistrito", districts) {
        clauses.push(clause);
    }
    if let Some(clause) = or_clause("descnivelmodalidad", levels) {
        clauses.push(clause);
    }
    clauses
}

fn or_clause(field: &str, values: &[String]) -> Option<String> {
    if values.is_empty() {
        return None;
    }
    let ors = values
        .iter()
        .map(|v| format!("{field}:\"{}\"", v.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" OR ");
    Some(format!("({ors})"))
}

/// Decodes one Solr response body into vacancy records.
pub fn parse_listing(body: &str, url: &str) -> Result<Vec<VacancyRecord>, FetchError> {
    let payload: SolrResponse =
        serde_json::from_str(body).map_err(|source| FetchError::Payload {
            url: url.to_string(),
            source,
        })?;
    Ok(payload
        .response
        .docs
        .into_iter()
        .map(SolrDoc::into_record)
        .collect())
}

#[derive(Debug, Deserialize)]
struct SolrResponse {
    #[serde(default)]
    response: SolrBody,
}

#[derive(Debug, Default, Deserialize)]
struct SolrBody {
    #[serde(default)]
    docs: Vec<SolrDoc>,
}

/// Raw upstream document; every field may be absent.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SolrDoc {
    id: String,
    cargo: String,
    descripcioncargo: String,
    areaincumbencia: String,
    descnivelmodalidad: String,
    descdistrito: String,
    escuela: String,
    domiciliodesempeno: String,
    turno: String,
    jornada: String,
    tomaposesion: Option<String>,
    finoferta: Option<String>,
    lunes: String,
    martes: String,
    miercoles: String,
    jueves: String,
    viernes: String,
    sabado: String,
    reemp_apeynom: Option<String>,
    reemp_motivo: Option<String>,
}

impl SolrDoc {
    fn into_record(self) -> VacancyRecord {
        let mut area_codes = BTreeSet::new();
        let area = normalize_code(&self.areaincumbencia);
        if !area.is_empty() {
            area_codes.insert(area);
        }

        let mut schedule = BTreeMap::new();
        let days = [
            ("lunes", self.lunes),
            ("martes", self.martes),
            ("miercoles", self.miercoles),
            ("jueves", self.jueves),
            ("viernes", self.viernes),
            ("sabado", self.sabado),
        ];
        for (day, hours) in days {
            if !hours.trim().is_empty() {
                schedule.insert(day.to_string(), hours);
            }
        }

        VacancyRecord {
            id: self.id,
            position: self.cargo,
            position_description: self.descripcioncargo,
            area_codes,
            level: self.descnivelmodalidad,
            district: self.descdistrito,
            school: self.escuela,
            address: self.domiciliodesempeno,
            shift: self.turno,
            workload: self.jornada,
            start_date: self.tomaposesion,
            offer_closes: self.finoferta,
            schedule,
            replaced_teacher: self.reemp_apeynom,
            replacement_reason: self.reemp_motivo,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodesError {
    #[error("reading codes file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parses oblea codes out of free-form text: one or more per line, comma or
/// whitespace separated, `#` comments and blank lines skipped. Oblea codes
/// run 2-4 characters, sometimes with a `/` or sign prefix (`/EF`, `+3N`).
pub fn parse_codes(text: &str) -> EligibilityCodes {
    let mut codes = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        for token in line.split(|c: char| c == ',' || c.is_whitespace()) {
            let code = normalize_code(token);
            if (2..=4).contains(&code.chars().count()) {
                codes.push(code);
            }
        }
    }
    EligibilityCodes::new(codes)
}

/// Loads the user's oblea codes. A missing file is a normal condition
/// (codes not configured yet) and yields an empty set; the engine warns.
pub fn load_codes_file(path: impl AsRef<Path>) -> Result<EligibilityCodes, CodesError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let codes = parse_codes(&text);
            info!(path = %path.display(), count = codes.len(), "oblea codes loaded");
            Ok(codes)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no codes file present");
            Ok(EligibilityCodes::default())
        }
        Err(source) => Err(CodesError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_queries_cover_state_district_and_levels() {
        let districts = vec!["Patagones".to_string()];
        let levels = vec!["Primaria".to_string(), "Artística".to_string()];
        let clauses = filter_queries(&districts, &levels);

        assert_eq!(
            clauses,
            vec![
                "estado:Publicada".to_string(),
                "(descdistrito:\"patagones\")".to_string(),
                "(descnivelmodalidad:\"primaria\" OR descnivelmodalidad:\"artística\")".to_string(),
            ]
        );
    }

    #[test]
    fn empty_filter_values_emit_no_clause() {
        let clauses = filter_queries(&[], &[]);
        assert_eq!(clauses, vec!["estado:Publicada".to_string()]);
    }

    #[test]
    fn listing_payload_maps_into_records() {
        let body = r#"{
            "response": {
                "numFound": 1,
                "docs": [{
                    "id": "OF-2026-00123",
                    "cargo": "PROFESOR/A DE MATEMATICA",
                    "descripcioncargo": "Suplencia",
                    "areaincumbencia": " mat ",
                    "descnivelmodalidad": "secundaria",
                    "descdistrito": "patagones",
                    "escuela": "E.E.S. N 2",
                    "domiciliodesempeno": "Mitre 350, Carmen de Patagones",
                    "turno": "M",
                    "jornada": "JS",
                    "tomaposesion": "2026-03-09",
                    "finoferta": "2026-03-06",
                    "lunes": "08:00-10:00",
                    "martes": "",
                    "reemp_apeynom": "García, María",
                    "reemp_motivo": "Licencia médica"
                }]
            }
        }"#;

        let records = parse_listing(body, "test://listing").expect("parse");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, "OF-2026-00123");
        assert!(record.area_codes.contains("MAT"));
        assert_eq!(record.level, "secundaria");
        assert_eq!(record.district, "patagones");
        assert_eq!(record.offer_closes.as_deref(), Some("2026-03-06"));
        assert_eq!(record.schedule.get("lunes").map(String::as_str), Some("08:00-10:00"));
        assert!(!record.schedule.contains_key("martes"));
        assert_eq!(record.replaced_teacher.as_deref(), Some("García, María"));
    }

    #[test]
    fn absent_fields_default_instead_of_failing() {
        let body = r#"{"response": {"docs": [{"id": "OF-1"}]}}"#;
        let records = parse_listing(body, "test://listing").expect("parse");
        assert_eq!(records[0].id, "OF-1");
        assert!(records[0].area_codes.is_empty());
        assert!(records[0].district.is_empty());
        assert!(records[0].start_date.is_none());
    }

    #[test]
    fn empty_response_yields_no_records() {
        let records = parse_listing(r#"{"response": {"docs": []}}"#, "test://listing").expect("parse");
        assert!(records.is_empty());
    }

    #[test]
    fn malformed_payload_is_a_payload_error() {
        let err = parse_listing("<html>gateway timeout</html>", "test://listing").expect_err("err");
        assert!(matches!(err, FetchError::Payload { .. }));
    }

    #[test]
    fn codes_parsing_skips_comments_and_normalizes() {
        let text = "# oblea 2026\nmat, len\n  /ef\n\nAPV  +3n\n";
        let codes = parse_codes(text);
        assert_eq!(codes.len(), 5);
        assert!(codes.contains("MAT"));
        assert!(codes.contains("LEN"));
        assert!(codes.contains("/EF"));
        assert!(codes.contains("APV"));
        assert!(codes.contains("+3N"));
    }

    #[test]
    fn codes_outside_length_bounds_are_dropped() {
        let codes = parse_codes("A\nABCDE\nMAT");
        assert_eq!(codes.len(), 1);
        assert!(codes.contains("MAT"));
    }

    #[test]
    fn missing_codes_file_is_an_empty_set() {
        let codes = load_codes_file("/nonexistent/codigos.txt").expect("load");
        assert!(codes.is_empty());
    }
}
