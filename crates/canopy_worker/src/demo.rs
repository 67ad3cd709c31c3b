//! Built-in `echo` plugin.
//!
//! Writes its inputs back as JSON artifacts. Parameters steer its behavior
//! so the runtime can be exercised end to end:
//!
//! - `artifacts` (int 0..=16, default 1): number of artifacts to produce
//! - `fail` (string): fail the whole computation with this user message
//! - `fail_artifact` (string): artifact name that fails with a user message
//! - `panic_artifact` (string): artifact name that panics
//! - `sleep_ms` (int): work time, checked against cancellation every 10 ms

use std::time::{Duration, Instant};

use canopy_protocol::{Aoi, ArtifactMeta, PluginRegistration, ShelfLife};
use serde_json::{json, Value};

use crate::plugin::{ArtifactOutput, ComputeContext, Plugin, PluginError};
use crate::registry::PluginRegistry;

pub const ECHO_PLUGIN_ID: &str = "echo";

const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(10);
const MAX_ARTIFACTS: u64 = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoPlugin;

impl Plugin for EchoPlugin {
    fn registration(&self) -> PluginRegistration {
        PluginRegistration {
            plugin_id: ECHO_PLUGIN_ID.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shelf_life: ShelfLife::For(Duration::from_secs(24 * 3600)),
            description: "Echoes parameters and AOI back as JSON artifacts".to_string(),
        }
    }

    fn validate_params(&self, params: &Value) -> Result<Value, PluginError> {
        let Some(fields) = params.as_object() else {
            return Err(PluginError::user("params must be a JSON object"));
        };
        let mut validated = fields.clone();
        match fields.get("artifacts") {
            None => {
                validated.insert("artifacts".to_string(), json!(1));
            }
            Some(count) => match count.as_u64() {
                Some(n) if n <= MAX_ARTIFACTS => {}
                _ => {
                    return Err(PluginError::user(format!(
                        "artifacts must be an integer between 0 and {}",
                        MAX_ARTIFACTS
                    )))
                }
            },
        }
        Ok(Value::Object(validated))
    }

    fn compute(
        &self,
        ctx: &mut ComputeContext,
        params: &Value,
        aoi: &Aoi,
    ) -> Result<(), PluginError> {
        if let Some(sleep_ms) = params.get("sleep_ms").and_then(Value::as_u64) {
            let deadline = Instant::now() + Duration::from_millis(sleep_ms);
            while Instant::now() < deadline {
                ctx.check_cancelled()?;
                std::thread::sleep(CANCEL_CHECK_INTERVAL);
            }
        }

        if let Some(message) = params.get("fail").and_then(Value::as_str) {
            return Err(PluginError::user(message));
        }

        let count = params.get("artifacts").and_then(Value::as_u64).unwrap_or(1);
        let failing = params.get("fail_artifact").and_then(Value::as_str);
        let panicking = params.get("panic_artifact").and_then(Value::as_str);

        for index in 0..count {
            let name = format!("Echo {}", index);
            ctx.artifact(&name, || {
                if failing == Some(name.as_str()) {
                    return Err(PluginError::user(format!("{} could not be produced", name)));
                }
                if panicking == Some(name.as_str()) {
                    panic!("{} blew up", name);
                }
                let body = json!({
                    "index": index,
                    "params": params,
                    "aoi": aoi,
                });
                let payload = serde_json::to_vec_pretty(&body).map_err(anyhow::Error::from)?;
                Ok(ArtifactOutput::new(
                    ArtifactMeta {
                        name: name.clone(),
                        filename: format!("echo_{}.json", index),
                        content_type: "application/json".to_string(),
                        primary: index == 0,
                        tags: ["echo".to_string()].into_iter().collect(),
                        summary: format!("Echo of the request inputs ({})", index),
                        ..Default::default()
                    },
                    payload,
                ))
            });
        }
        Ok(())
    }
}

/// Registry holding every built-in plugin.
pub fn builtin_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    // Built-in ids are distinct; a duplicate would be a programming error.
    let _ = registry.register(EchoPlugin);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_protocol::{CorrelationId, Geometry};
    use tokio_util::sync::CancellationToken;

    fn aoi() -> Aoi {
        Aoi::new(Geometry::Polygon(vec![vec![
            [0.0, 0.0],
            [1.0, 0.0],
            [1.0, 1.0],
            [0.0, 0.0],
        ]]))
    }

    fn run(params: Value) -> (Result<(), PluginError>, ComputeContext) {
        let mut ctx = ComputeContext::new(CorrelationId::new(), CancellationToken::new());
        let result = EchoPlugin.compute(&mut ctx, &params, &aoi());
        (result, ctx)
    }

    #[test]
    fn test_produces_requested_artifacts() {
        let (result, ctx) = run(json!({"artifacts": 3}));
        assert!(result.is_ok());
        let (drafts, warnings) = ctx.into_parts();
        assert_eq!(drafts.len(), 3);
        assert!(drafts[0].meta.primary);
        assert_eq!(drafts[2].meta.filename, "echo_2.json");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_failing_artifact_becomes_warning() {
        let (result, ctx) = run(json!({"artifacts": 2, "fail_artifact": "Echo 0"}));
        assert!(result.is_ok());
        assert_eq!(ctx.draft_count(), 1);
        assert_eq!(
            ctx.warnings().get("Echo 0").map(String::as_str),
            Some("Echo 0 could not be produced")
        );
    }

    #[test]
    fn test_user_failure() {
        let (result, _) = run(json!({"fail": "AOI too large"}));
        assert!(matches!(result, Err(PluginError::User(message)) if message == "AOI too large"));
    }

    #[test]
    fn test_stops_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let mut ctx = ComputeContext::new(CorrelationId::new(), token);
        let result = EchoPlugin.compute(&mut ctx, &json!({"sleep_ms": 10_000}), &aoi());
        assert!(matches!(result, Err(PluginError::Cancelled)));
    }

    #[test]
    fn test_validate_params_fills_default_count() {
        let validated = EchoPlugin.validate_params(&json!({"x": 1})).unwrap();
        assert_eq!(validated, json!({"x": 1, "artifacts": 1}));
        let validated = EchoPlugin.validate_params(&json!({"artifacts": 3})).unwrap();
        assert_eq!(validated, json!({"artifacts": 3}));
    }

    #[test]
    fn test_validate_params_rejects_bad_count() {
        for params in [json!({"artifacts": "many"}), json!({"artifacts": 17}), json!([1, 2])] {
            let result = EchoPlugin.validate_params(&params);
            assert!(matches!(result, Err(PluginError::User(_))), "{}", params);
        }
    }

    #[test]
    fn test_builtin_registry_contains_echo() {
        assert!(builtin_registry().get(ECHO_PLUGIN_ID).is_ok());
    }
}
