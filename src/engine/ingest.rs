use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;

use super::updater::Parent;
use super::{Engine, Principal};
use crate::error::{Error, Result};
use crate::types::*;

/// One externally observed change. Ids are in encoded form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert {
        spec: String,
        /// Owning resource; `None` for a root collection.
        #[serde(default)]
        parent: Option<String>,
        field: String,
        #[serde(default)]
        fields: Document,
    },
    Update { id: String, fields: Document },
    Delete { id: String },
    Link { owner: String, field: String, target: String },
    Unlink { owner: String, field: String, target: String },
    Move {
        id: String,
        #[serde(default)]
        parent: Option<String>,
        field: String,
    },
}

/// A stream of change events.
pub trait ChangeSource: Send {
    /// The next event, or `None` once the source is exhausted.
    fn next(&mut self) -> impl Future<Output = Option<ChangeEvent>> + Send;
}

impl ChangeSource for mpsc::Receiver<ChangeEvent> {
    async fn next(&mut self) -> Option<ChangeEvent> {
        self.recv().await
    }
}

fn parent_of(engine: &Engine, parent: Option<&str>, field: &str) -> Result<Parent> {
    match parent {
        None => Ok(Parent::root(field)),
        Some(encoded) => {
            let doc = engine
                .store()
                .get_resource(&ResourceId::decode(encoded)?)?
                .ok_or(Error::NotFound)?;
            Parent::of(&doc, field)
        }
    }
}

/// Applies one event as the system principal.
pub fn apply_event(engine: &Engine, event: ChangeEvent) -> Result<()> {
    let ctx = engine.context(Principal::System);
    let updater = engine.updater(&ctx);
    match event {
        ChangeEvent::Insert {
            spec,
            parent,
            field,
            fields,
        } => {
            let parent = parent_of(engine, parent.as_deref(), &field)?;
            updater.create_resource(&spec, &parent, fields)?;
        }
        ChangeEvent::Update { id, fields } => {
            updater.update_fields(&ResourceId::decode(&id)?, fields)?;
        }
        ChangeEvent::Delete { id } => {
            updater.delete_resource(&ResourceId::decode(&id)?)?;
        }
        ChangeEvent::Link { owner, field, target } => {
            updater.create_linkcollection_entry(
                &ResourceId::decode(&owner)?,
                &field,
                &ResourceId::decode(&target)?,
            )?;
        }
        ChangeEvent::Unlink { owner, field, target } => {
            updater.delete_linkcollection_entry(
                &ResourceId::decode(&owner)?,
                &field,
                &ResourceId::decode(&target)?,
            )?;
        }
        ChangeEvent::Move { id, parent, field } => {
            let parent = parent_of(engine, parent.as_deref(), &field)?;
            updater.move_resource(&ResourceId::decode(&id)?, &parent)?;
        }
    }
    Ok(())
}

/// Drains `source`, applying each event in order. A failing event is
/// logged and skipped. Returns the number of events applied.
pub async fn run_ingest<S: ChangeSource>(engine: Arc<Engine>, mut source: S) -> usize {
    let mut applied = 0;
    while let Some(event) = source.next().await {
        let engine = Arc::clone(&engine);
        let described = format!("{event:?}");
        match tokio::task::spawn_blocking(move || apply_event(&engine, event)).await {
            Ok(Ok(())) => applied += 1,
            Ok(Err(e)) => tracing::warn!(error = %e, event = described, "ingest event rejected"),
            Err(e) => tracing::error!(error = %e, "ingest task panicked"),
        }
    }
    tracing::info!(applied, "change source exhausted");
    applied
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::testing::*;
    use crate::plan::Filter;
    use crate::schema::Field;

    #[test]
    fn test_event_deserialization() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "op": "insert",
            "spec": "employee",
            "field": "employees",
            "fields": {"age": 3}
        }))
        .unwrap();
        assert!(matches!(event, ChangeEvent::Insert { parent: None, .. }));
    }

    #[tokio::test]
    async fn test_ingest_drives_calcs() {
        let mut def = company();
        def.add_field("calcs", Field::calc("total", "sum(employees.age)")).unwrap();
        let engine = Arc::new(engine_with(def));
        let calcs = create(&engine, "calcs", &root("calcs"), json!({}));

        let (tx, rx) = mpsc::channel(8);
        tx.send(ChangeEvent::Insert {
            spec: "employee".into(),
            parent: None,
            field: "employees".into(),
            fields: fields(json!({"age": 5})),
        })
        .await
        .unwrap();
        tx.send(ChangeEvent::Delete {
            id: ResourceId::generate().encode(),
        })
        .await
        .unwrap();
        drop(tx);

        let applied = run_ingest(Arc::clone(&engine), rx).await;
        assert_eq!(applied, 1);
        assert_eq!(value(&engine, &calcs, "total"), json!(5));

        let employees = engine
            .store()
            .find(&Filter::eq(TYPE, "employee"), None)
            .unwrap();
        assert_eq!(employees.len(), 1);
    }
}
