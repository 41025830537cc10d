//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Client for the remote allocation predictor.
//!
//! The allocation run never blocks on the network: a run consumes the
//! response to the request sent on an earlier run (if one has completed)
//! and then publishes a new request. Every failure mode falls back to the
//! local greedy algorithm.

use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use futures::{future::BoxFuture, FutureExt};
use log::*;
use thiserror::Error;
use tokio::{runtime::Handle, task::JoinHandle};

use crate::config::Config;

#[cfg(test)]
type PredictorCallback = fn(body: Vec<u8>) -> BoxFuture<'static, Result<String>>;

enum PredictorMode {
    Off,
    Url {
        url: reqwest::Url,
        client: reqwest::Client,
    },
    #[cfg(test)]
    Callback(PredictorCallback),
}

/// A parsed predictor response: whether the remote decision should be used
/// at all, and the hinted target layer index per peer endpoint.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Prediction {
    pub use_rl: bool,
    pub target_index_by_endpoint: HashMap<String, i64>,
}

#[derive(Debug, Error)]
enum PredictorError {
    #[error("predictor response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("predictor response is missing the useRL key")]
    MissingUseRl,
}

fn parse_prediction(body: &str) -> Result<Prediction, PredictorError> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    let object = value.as_object().ok_or(PredictorError::MissingUseRl)?;
    let use_rl = object
        .get("useRL")
        .and_then(serde_json::Value::as_i64)
        .ok_or(PredictorError::MissingUseRl)?
        == 1;
    let target_index_by_endpoint = object
        .iter()
        .filter(|(key, _)| key.as_str() != "useRL")
        .filter_map(|(key, value)| value.as_i64().map(|index| (key.clone(), index)))
        .collect();
    Ok(Prediction {
        use_rl,
        target_index_by_endpoint,
    })
}

pub struct PredictorClient {
    mode: PredictorMode,
    timeout: Duration,
    in_flight: Option<JoinHandle<Option<Prediction>>>,
}

impl PredictorClient {
    pub fn from_config(config: &Config) -> Self {
        let mode = match config.predictor_url.as_deref() {
            None => PredictorMode::Off,
            Some(url) => match reqwest::Url::parse(url) {
                Ok(url) => PredictorMode::Url {
                    url,
                    client: reqwest::Client::new(),
                },
                Err(err) => {
                    warn!("invalid predictor URL {:?}, disabling predictor: {}", url, err);
                    PredictorMode::Off
                }
            },
        };
        Self {
            mode,
            timeout: config.predictor_timeout(),
            in_flight: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_callback(callback: PredictorCallback, timeout: Duration) -> Self {
        Self {
            mode: PredictorMode::Callback(callback),
            timeout,
            in_flight: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.mode, PredictorMode::Off)
    }

    /// Collect the response to the request sent on an earlier run, if it
    /// has completed by now. Each response is consumed at most once; a
    /// request that is still in flight is left alone.
    pub fn take_prediction(&mut self) -> Option<Prediction> {
        let in_flight = self.in_flight.take()?;
        if !in_flight.is_finished() {
            self.in_flight = Some(in_flight);
            return None;
        }
        match in_flight.now_or_never() {
            Some(Ok(prediction)) => prediction,
            Some(Err(err)) => {
                debug!("predictor task failed: {}", err);
                None
            }
            None => None,
        }
    }

    /// POST `snapshot` to the predictor without blocking the caller. The
    /// exchange is bounded by the configured timeout; timeouts are not
    /// errors, they just leave the next run on the greedy path.
    pub fn request(&mut self, snapshot: serde_json::Value) {
        if matches!(self.mode, PredictorMode::Off) {
            return;
        }
        if self.in_flight.is_some() {
            debug!("predictor request still in flight, skipping this run");
            return;
        }
        if Handle::try_current().is_err() {
            debug!("called outside of tokio runtime; can't reach the predictor");
            return;
        }

        let request: BoxFuture<'static, Result<String>> = match &self.mode {
            PredictorMode::Off => {
                unreachable!("checked above");
            }
            PredictorMode::Url { url, client } => {
                let client = client.clone();
                let url = url.clone();
                Box::pin(async move {
                    let response = client.post(url).json(&snapshot).send().await?;
                    Ok(response.text().await?)
                })
            }
            #[cfg(test)]
            PredictorMode::Callback(callback) => {
                callback(serde_json::to_vec(&snapshot).unwrap())
            }
        };

        let timeout = self.timeout;
        self.in_flight = Some(tokio::spawn(async move {
            tokio::select!(
                _ = tokio::time::sleep(timeout) => {
                    debug!("predictor request timed out");
                    None
                },
                body = request => match body {
                    Ok(body) => match parse_prediction(&body) {
                        Ok(prediction) => Some(prediction),
                        Err(err) => {
                            info!("ignoring predictor response: {}", err);
                            None
                        }
                    },
                    Err(err) => {
                        debug!("predictor request failed: {}", err);
                        None
                    }
                },
            )
        }));
    }
}
