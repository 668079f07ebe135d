//! Externally measured electrical power draw of the heat pump.
//!
//! The heat pump's own consumption register is coarse. A separate energy meter, exposed as a
//! Home Assistant entity, gives a better figure for the coefficient of performance.
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not construct the HTTP client")]
    CreateReqwest(#[source] reqwest::Error),
    #[error("cannot address entity states relative to `{0}`")]
    BadUrl(reqwest::Url),
    #[error("could not read the access token from {1:?}")]
    ReadToken(#[source] std::io::Error, PathBuf),
    #[error("power state request failed")]
    Request(#[source] reqwest::Error),
    #[error("power state response is not valid JSON")]
    JsonDecode(#[source] reqwest::Error),
}

/// Supplies the last known electrical power draw, in W.
pub trait PowerSource: Send + Sync {
    fn last_known(&self) -> Option<f64>;
}

#[derive(clap::Parser, Clone)]
#[group(id = "power::Args")]
pub struct Args {
    /// Base URL of a Home Assistant instance that measures the heat pump's power draw
    /// (e.g. `http://homeassistant.local:8123`).
    #[arg(long, requires = "power_entity")]
    power_url: Option<reqwest::Url>,

    /// The entity holding the power draw, in W or kW (e.g. `sensor.heat_pump_power`).
    #[arg(long, requires = "power_url")]
    power_entity: Option<String>,

    /// File containing a long-lived access token for the Home Assistant API.
    #[arg(long)]
    power_token_file: Option<PathBuf>,

    /// Give up on a power state request after this long.
    #[arg(long, default_value = "5s")]
    power_timeout: humantime::Duration,
}

pub struct HomeAssistantPower {
    client: reqwest::Client,
    url: reqwest::Url,
    token: Option<String>,
    last: Mutex<Option<f64>>,
}

impl HomeAssistantPower {
    /// `None` if no power entity was configured.
    pub async fn from_args(args: &Args) -> Result<Option<Self>, Error> {
        let (Some(base), Some(entity)) = (&args.power_url, &args.power_entity) else {
            return Ok(None);
        };
        let token = match &args.power_token_file {
            None => None,
            Some(path) => {
                let token = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| Error::ReadToken(e, path.clone()))?;
                Some(token.trim().to_string())
            }
        };
        let client = reqwest::Client::builder()
            .timeout(*args.power_timeout)
            .build()
            .map_err(Error::CreateReqwest)?;
        Ok(Some(Self { client, url: state_url(base, entity)?, token, last: Mutex::new(None) }))
    }

    /// Fetch the current state of the entity and remember it.
    ///
    /// A state that isn't a number (`unavailable`, `unknown`, ...) clears the last known value.
    /// Request failures keep it.
    pub async fn refresh(&self) -> Result<Option<f64>, Error> {
        let mut request = self.client.get(self.url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(Error::Request)?;
        let state = response.json::<serde_json::Value>().await.map_err(Error::JsonDecode)?;
        let watts = parse_state(&state);
        if watts.is_none() {
            debug!(message = "power state is not usable", ?state);
        }
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = watts;
        Ok(watts)
    }
}

impl PowerSource for HomeAssistantPower {
    fn last_known(&self) -> Option<f64> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn state_url(base: &reqwest::Url, entity: &str) -> Result<reqwest::Url, Error> {
    let mut url = base.clone();
    match url.path_segments_mut() {
        Ok(mut segments) => {
            segments.pop_if_empty().extend(["api", "states", entity]);
        }
        Err(()) => return Err(Error::BadUrl(base.clone())),
    }
    Ok(url)
}

/// Extract a power in W from a Home Assistant entity state object.
pub fn parse_state(state: &serde_json::Value) -> Option<f64> {
    let value = state.get("state")?.as_str()?.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    let unit = state
        .get("attributes")
        .and_then(|a| a.get("unit_of_measurement"))
        .and_then(|u| u.as_str());
    match unit {
        None | Some("W") => Some(value),
        Some("kW") => Some(value * 1000.0),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_states() {
        assert_eq!(parse_state(&json!({"state": "612.5"})), Some(612.5));
        assert_eq!(
            parse_state(&json!({"state": "0.6", "attributes": {"unit_of_measurement": "kW"}})),
            Some(600.0)
        );
        assert_eq!(parse_state(&json!({"state": "unavailable"})), None);
        assert_eq!(parse_state(&json!({"state": "unknown"})), None);
        assert_eq!(parse_state(&json!({"state": "NaN"})), None);
        assert_eq!(parse_state(&json!({"state": "5", "attributes": {"unit_of_measurement": "MWh"}})), None);
        assert_eq!(parse_state(&json!({"entity_id": "sensor.power"})), None);
    }

    #[test]
    fn builds_state_urls() {
        let base: reqwest::Url = "http://ha.local:8123/".parse().unwrap();
        let url = state_url(&base, "sensor.heat_pump_power").unwrap();
        assert_eq!(url.as_str(), "http://ha.local:8123/api/states/sensor.heat_pump_power");
        let prefixed: reqwest::Url = "https://example.com/ha".parse().unwrap();
        let url = state_url(&prefixed, "sensor.p").unwrap();
        assert_eq!(url.as_str(), "https://example.com/ha/api/states/sensor.p");
        let opaque: reqwest::Url = "mailto:someone@example.com".parse().unwrap();
        assert!(matches!(state_url(&opaque, "sensor.p"), Err(Error::BadUrl(_))));
    }
}
