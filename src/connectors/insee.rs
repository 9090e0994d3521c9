//! Connector for the INSEE statistical APIs.
//!
//! One source type, three fetch shapes:
//! - `sirene`: establishment lookup by SIRET, or search with `q`
//! - `series`: BDM time series observations, one record per period
//! - `geo`: local indicators by geographic code

use async_trait::async_trait;
use serde_json::Value;
use std::str::FromStr;
use tracing::{info, instrument};

use super::{into_records, param_str, ConnectorBase, ConnectorContext};
use crate::error::HarvestError;
use crate::model::{HarvestParams, HarvestResult, Record, SourceConfig};
use crate::persistence::document::ID_FIELD;
use crate::traits::{Connector, SourceStore};

pub const SOURCE_TYPE: &str = "insee";

const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InseeMode {
    Sirene,
    Series,
    Geo,
}

impl FromStr for InseeMode {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sirene" => Ok(Self::Sirene),
            "series" | "bdm" => Ok(Self::Series),
            "geo" | "local" => Ok(Self::Geo),
            other => Err(HarvestError::InvalidParams(format!("unknown insee mode '{}'", other))),
        }
    }
}

pub struct InseeConnector {
    base: ConnectorBase,
}

impl InseeConnector {
    pub fn new(ctx: ConnectorContext) -> Result<Self, HarvestError> {
        Ok(Self {
            base: ConnectorBase::new(&ctx)?,
        })
    }

    /// `params.mode`, else the source's `kind`, else `sirene`.
    pub fn mode_for(&self, params: &HarvestParams) -> Result<InseeMode, HarvestError> {
        match param_str(params, "mode").or_else(|| self.base.source().kind.clone()) {
            Some(mode) => mode.parse(),
            None => Ok(InseeMode::Sirene),
        }
    }

    async fn fetch_sirene(&self, params: &HarvestParams) -> Result<Vec<Record>, HarvestError> {
        let client = self.base.client();

        if let Some(siret) = param_str(params, "siret") {
            let body = client.get_json(&segment_path("siret", &siret), &[]).await?;
            let etablissement = self.field(&body, "etablissement")?;
            let mut records = into_records(etablissement);
            for record in &mut records {
                record
                    .entry(ID_FIELD)
                    .or_insert_with(|| Value::String(siret.clone()));
            }
            return Ok(records);
        }

        let q = param_str(params, "q")
            .ok_or_else(|| HarvestError::InvalidParams("sirene mode needs 'siret' or 'q'".into()))?;
        let page_size =
            param_str(params, "nombre").unwrap_or_else(|| DEFAULT_PAGE_SIZE.to_string());
        let mut query = vec![("q".to_string(), q), ("nombre".to_string(), page_size)];
        if let Some(start) = param_str(params, "debut") {
            query.push(("debut".to_string(), start));
        }

        let body = client.get_json("siret", &query).await?;
        let mut records = into_records(self.field(&body, "etablissements")?);
        for record in &mut records {
            if let Some(siret) = record.get("siret").cloned() {
                record.entry(ID_FIELD).or_insert(siret);
            }
        }
        Ok(records)
    }

    async fn fetch_series(&self, params: &HarvestParams) -> Result<Vec<Record>, HarvestError> {
        let series_id = param_str(params, "seriesId")
            .ok_or_else(|| HarvestError::InvalidParams("series mode needs 'seriesId'".into()))?;
        let query: Vec<(String, String)> = ["startPeriod", "endPeriod"]
            .into_iter()
            .filter_map(|key| param_str(params, key).map(|v| (key.to_string(), v)))
            .collect();

        let body = self
            .base
            .client()
            .get_json(&segment_path("series", &series_id), &query)
            .await?;
        let observations = self.field(&body, "observations")?;

        Ok(into_records(observations)
            .into_iter()
            .map(|obs| {
                let period = obs.get("period").cloned().unwrap_or(Value::Null);
                let mut record = Record::new();
                record.insert(
                    ID_FIELD.to_string(),
                    Value::String(format!("{}:{}", series_id, text(&period))),
                );
                record.insert("seriesId".to_string(), Value::String(series_id.clone()));
                record.insert("period".to_string(), period);
                record.insert(
                    "value".to_string(),
                    obs.get("value").cloned().unwrap_or(Value::Null),
                );
                record
            })
            .collect())
    }

    async fn fetch_geo(&self, params: &HarvestParams) -> Result<Vec<Record>, HarvestError> {
        let indicator = param_str(params, "indicator")
            .ok_or_else(|| HarvestError::InvalidParams("geo mode needs 'indicator'".into()))?;
        let mut query = Vec::new();
        if let Some(code) = param_str(params, "code") {
            query.push(("codgeo".to_string(), code));
        }

        let body = self
            .base
            .client()
            .get_json(&segment_path("geo", &indicator), &query)
            .await?;
        let cells = match &body {
            Value::Array(_) => body.clone(),
            _ => body
                .get("Cellule")
                .or_else(|| body.get("data"))
                .cloned()
                .ok_or_else(|| self.unexpected("missing 'Cellule' or 'data'"))?,
        };

        let mut records = into_records(cells);
        for record in &mut records {
            record
                .entry("indicator")
                .or_insert_with(|| Value::String(indicator.clone()));
        }
        Ok(records)
    }

    fn field(&self, body: &Value, name: &str) -> Result<Value, HarvestError> {
        body.get(name)
            .cloned()
            .ok_or_else(|| self.unexpected(&format!("missing '{}'", name)))
    }

    fn unexpected(&self, message: &str) -> HarvestError {
        HarvestError::UnexpectedResponse {
            source_id: self.base.source().id.clone(),
            message: message.to_string(),
        }
    }
}

/// `<resource>/<value>` with `value` percent-encoded as a single segment.
fn segment_path(resource: &str, value: &str) -> String {
    format!("{}/{}", resource, urlencoding::encode(value))
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Connector for InseeConnector {
    fn source(&self) -> &SourceConfig {
        self.base.source()
    }

    fn store(&self) -> &SourceStore {
        self.base.store()
    }

    #[instrument(skip(self, params), fields(source_id = %self.base.source().id))]
    async fn harvest(&self, params: &HarvestParams) -> Result<HarvestResult, HarvestError> {
        let mode = self.mode_for(params)?;
        info!(?mode, "Starting INSEE harvest");

        let pipeline = self.base.pipeline();
        match mode {
            InseeMode::Sirene => pipeline.execute(self.fetch_sirene(params)).await,
            InseeMode::Series => pipeline.execute(self.fetch_series(params)).await,
            InseeMode::Geo => pipeline.execute(self.fetch_geo(params)).await,
        }
    }
}
