//! Test support: a scriptable provider invoker
//!
//! Each provider gets a queue of steps; the last step repeats once the
//! queue is drained, so "always succeeds" and "fails twice then recovers"
//! are both one-liners. The invoker records every call and tracks peak
//! concurrency so tests can assert on dispatch behavior.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{ProviderFailure, ProviderInvoker, ProviderResponse};

#[derive(Debug, Clone)]
pub enum Step {
    Ok {
        delay: Duration,
        cost: f64,
        quality: Option<f64>,
    },
    Err(ProviderFailure),
    /// Never returns within any test's lifetime
    Hang,
}

impl Step {
    pub fn ok(delay: Duration) -> Self {
        Step::Ok {
            delay,
            cost: 0.0,
            quality: None,
        }
    }

    pub fn ok_with_quality(delay: Duration, quality: f64) -> Self {
        Step::Ok {
            delay,
            cost: 0.0,
            quality: Some(quality),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    pub calls: Mutex<Vec<(String, serde_json::Value)>>,
    current: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a provider's behavior; the final step repeats forever.
    pub fn script<S: Into<String>>(self, provider: S, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(provider.into(), steps.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Providers called, in call order.
    pub fn called_providers(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(provider, _)| provider.clone())
            .collect()
    }

    /// `marker` fields of the call payloads, in call order.
    pub fn called_markers(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, payload)| {
                payload
                    .get("marker")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .collect()
    }

    fn next_step(&self, provider: &str) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(provider) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap(),
            Some(steps) => steps
                .front()
                .cloned()
                .unwrap_or_else(|| Step::ok(Duration::ZERO)),
            None => Step::ok(Duration::ZERO),
        }
    }
}

#[async_trait]
impl ProviderInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        provider_id: &str,
        payload: &serde_json::Value,
        _deadline: Duration,
    ) -> std::result::Result<ProviderResponse, ProviderFailure> {
        self.calls
            .lock()
            .unwrap()
            .push((provider_id.to_string(), payload.clone()));
        let concurrent = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(concurrent, Ordering::SeqCst);

        let step = self.next_step(provider_id);
        let result = match step {
            Step::Ok {
                delay,
                cost,
                quality,
            } => {
                tokio::time::sleep(delay).await;
                let mut response = ProviderResponse::new(payload.clone()).cost(cost);
                if let Some(quality) = quality {
                    response = response.quality(quality);
                }
                Ok(response)
            }
            Step::Err(failure) => {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Err(failure)
            }
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderFailure::Other("hang elapsed".to_string()))
            }
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
