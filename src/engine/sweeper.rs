use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::updater::{Change, DIRTY_CHANGED, DIRTY_RECOMPUTE, PropagationReport};
use super::{Engine, Principal};
use crate::error::Result;
use crate::plan::Filter;
use crate::types::*;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Resources whose recorded frontier was picked up.
    pub resources: usize,
    pub propagation: PropagationReport,
    /// Propagation records closed because nothing is left pending.
    pub finished: usize,
}

fn strings(value: Option<Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
        .iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect()
}

/// Resumes every recorded frontier once.
pub fn sweep(engine: &Engine) -> Result<SweepReport> {
    let changed_path = format!("{DIRTY}.{DIRTY_CHANGED}");
    let recompute_path = format!("{DIRTY}.{DIRTY_RECOMPUTE}");
    let store = engine.store();
    let pending = store.find(
        &Filter::Or(vec![
            Filter::Exists {
                field: changed_path.clone(),
                exists: true,
            },
            Filter::Exists {
                field: recompute_path.clone(),
                exists: true,
            },
        ]),
        None,
    )?;

    let mut changes = Vec::new();
    let mut recompute = Vec::new();
    for doc in &pending {
        let (Some(spec), Some(id)) = (doc_str(doc, TYPE), doc_id(doc)) else {
            continue;
        };
        // Cleared up front: a resume that expires again records afresh.
        store.update_resource(
            &id,
            &Document::new(),
            &[changed_path.clone(), recompute_path.clone()],
            None,
        )?;
        let deps = strings(get_path(doc, &changed_path));
        if !deps.is_empty() {
            changes.push(Change::new(spec, &id, deps));
        }
        recompute.extend(
            strings(get_path(doc, &recompute_path))
                .into_iter()
                .map(|field| (spec.to_string(), field, id.clone())),
        );
    }

    let mut report = SweepReport {
        resources: pending.len(),
        ..SweepReport::default()
    };
    if !pending.is_empty() {
        let ctx = engine.context(Principal::System);
        report.propagation = engine.updater(&ctx).resume(changes, recompute);
    }
    if report.propagation.deferred == 0 {
        for record in store.list_updates(true)? {
            if record.kind == UpdateKind::Propagation {
                store.finish_update(&record.id, None)?;
                report.finished += 1;
            }
        }
    }

    if report.resources > 0 {
        tracing::info!(
            resources = report.resources,
            written = report.propagation.written,
            deferred = report.propagation.deferred,
            "swept dirty frontiers"
        );
    }
    Ok(report)
}

/// Runs [`sweep`] on the engine's configured interval until the runtime
/// shuts down.
pub fn spawn(engine: Arc<Engine>) -> JoinHandle<()> {
    let period = engine.config().sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let engine = Arc::clone(&engine);
            match tokio::task::spawn_blocking(move || sweep(&engine)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "sweep failed"),
                Err(e) => tracing::error!(error = %e, "sweep task panicked"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::testing::*;
    use crate::schema::Field;

    #[test]
    fn test_sweep_finishes_deferred_propagation() {
        let mut def = company();
        def.add_field("employee", Field::calc("double", "self.age * 2")).unwrap();
        def.add_field("calcs", Field::calc("total", "sum(employees.double)")).unwrap();
        let store = store_with(def);

        let hurried = Engine::open(
            Arc::clone(&store),
            EngineConfig {
                propagation_deadline_ms: 0,
                ..EngineConfig::default()
            },
        )
        .unwrap();
        let calcs = create(&hurried, "calcs", &root("calcs"), json!({}));
        let e = create(&hurried, "employee", &root("employees"), json!({"age": 4}));
        assert_eq!(value(&hurried, &e, "double"), json!(null));
        assert_eq!(store.list_updates(true).unwrap().len(), 2);

        let patient = Engine::open(store, EngineConfig::default()).unwrap();
        let report = sweep(&patient).unwrap();
        assert_eq!(report.resources, 2);
        assert_eq!(report.propagation.deferred, 0);
        assert_eq!(value(&patient, &e, "double"), json!(8));
        assert_eq!(value(&patient, &calcs, "total"), json!(8));
        assert!(get_path(&get(&patient, &e), "_dirty._recompute").is_none());
        assert!(patient.store().list_updates(true).unwrap().is_empty());

        let again = sweep(&patient).unwrap();
        assert_eq!(again.resources, 0);
    }
}
