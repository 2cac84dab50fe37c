use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::Store;
use super::eval::{compare, evaluate, matches, sort_order, values_at};
use crate::error::Result;
use crate::plan::{AccOp, Accumulator, Filter, Pipeline, Stage};
use crate::types::{Document, ID, ResourceId, TYPE, get_path, set_path};

/// Runs a pipeline. A leading `$match` is pushed down to [`Store::find`];
/// later stages run in memory.
pub fn run(store: &dyn Store, pipeline: &Pipeline, ctx: Option<&ResourceId>) -> Result<Vec<Document>> {
    let (mut docs, rest) = match pipeline.stages.split_first() {
        Some((Stage::Match(filter), rest)) => (store.find(filter, ctx)?, rest),
        _ => (store.find(&Filter::And(Vec::new()), ctx)?, pipeline.stages.as_slice()),
    };
    for stage in rest {
        docs = apply(store, stage, docs, ctx)?;
        if docs.is_empty() {
            break;
        }
    }
    Ok(docs)
}

fn apply(store: &dyn Store, stage: &Stage, mut docs: Vec<Document>, ctx: Option<&ResourceId>) -> Result<Vec<Document>> {
    match stage {
        Stage::Match(filter) => {
            docs.retain(|d| matches(d, filter, ctx));
            Ok(docs)
        }
        Stage::AddFields(fields) => {
            for doc in &mut docs {
                for (name, expr) in fields {
                    let value = evaluate(doc, expr, ctx)?;
                    set_path(doc, name, value);
                }
            }
            Ok(docs)
        }
        Stage::Lookup {
            from,
            local_field,
            foreign_field,
            as_field,
        } => lookup(store, docs, from, local_field, foreign_field, as_field, ctx),
        Stage::LookupPipeline { pipeline, as_field } => {
            if docs.is_empty() {
                return Ok(docs);
            }
            let joined: Vec<Value> = run(store, pipeline, ctx)?
                .into_iter()
                .map(Value::Object)
                .collect();
            for doc in &mut docs {
                doc.insert(as_field.clone(), Value::Array(joined.clone()));
            }
            Ok(docs)
        }
        Stage::Group { key, fields } => group(docs, key, fields, ctx),
        Stage::Unwind(field) => {
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                match doc.get(field) {
                    Some(Value::Array(items)) => {
                        for item in items.clone() {
                            let mut copy = doc.clone();
                            copy.insert(field.clone(), item);
                            out.push(copy);
                        }
                    }
                    Some(Value::Null) | None => {}
                    Some(_) => out.push(doc),
                }
            }
            Ok(out)
        }
        Stage::ReplaceRoot(field) => Ok(docs
            .into_iter()
            .filter_map(|d| match get_path(&d, field) {
                Some(Value::Object(inner)) => Some(inner),
                _ => None,
            })
            .collect()),
        Stage::Project(fields) => Ok(docs
            .into_iter()
            .map(|d| {
                d.into_iter()
                    .filter(|(k, _)| k == ID || fields.contains(k))
                    .collect()
            })
            .collect()),
        Stage::Sort(keys) => {
            docs.sort_by(|a, b| {
                for (field, ascending) in keys {
                    let x = get_path(a, field).unwrap_or(Value::Null);
                    let y = get_path(b, field).unwrap_or(Value::Null);
                    let ord = sort_order(&x, &y);
                    if ord.is_ne() {
                        return if *ascending { ord } else { ord.reverse() };
                    }
                }
                std::cmp::Ordering::Equal
            });
            Ok(docs)
        }
        Stage::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
        Stage::Limit(n) => {
            docs.truncate(*n);
            Ok(docs)
        }
    }
}

fn lookup(
    store: &dyn Store,
    mut docs: Vec<Document>,
    from: &str,
    local_field: &str,
    foreign_field: &str,
    as_field: &str,
    ctx: Option<&ResourceId>,
) -> Result<Vec<Document>> {
    let locals: Vec<Vec<Value>> = docs
        .iter()
        .map(|d| {
            values_at(d, local_field)
                .into_iter()
                .filter(|v| !v.is_null())
                .collect()
        })
        .collect();
    let mut wanted: Vec<Value> = locals.iter().flatten().cloned().collect();
    wanted.sort_by(sort_order);
    wanted.dedup();

    let found = if wanted.is_empty() {
        Vec::new()
    } else {
        store.find(
            &Filter::And(vec![Filter::eq(TYPE, from), Filter::is_in(foreign_field, wanted)]),
            ctx,
        )?
    };

    for (doc, keys) in docs.iter_mut().zip(locals) {
        let joined: Vec<Value> = found
            .iter()
            .filter(|f| {
                values_at(f, foreign_field)
                    .iter()
                    .any(|v| keys.iter().any(|k| compare(v, k).is_some_and(|o| o.is_eq())))
            })
            .cloned()
            .map(Value::Object)
            .collect();
        doc.insert(as_field.to_string(), Value::Array(joined));
    }
    Ok(docs)
}

#[derive(Default)]
struct Acc {
    int_sum: i64,
    float_sum: f64,
    all_int: bool,
    count: usize,
    best: Option<Value>,
    first: Option<Value>,
    items: Vec<Value>,
}

impl Acc {
    fn add(&mut self, op: AccOp, value: Value) {
        if self.first.is_none() {
            self.first = Some(value.clone());
        }
        match op {
            AccOp::Sum | AccOp::Avg => {
                if let Value::Number(n) = &value {
                    if self.count == 0 {
                        self.all_int = true;
                    }
                    self.count += 1;
                    match n.as_i64() {
                        Some(i) if self.all_int => match self.int_sum.checked_add(i) {
                            Some(s) => self.int_sum = s,
                            None => {
                                self.all_int = false;
                                self.float_sum = self.int_sum as f64 + i as f64;
                            }
                        },
                        _ => {
                            if self.all_int {
                                self.all_int = false;
                                self.float_sum = self.int_sum as f64;
                            }
                            self.float_sum += n.as_f64().unwrap_or_default();
                        }
                    }
                }
            }
            AccOp::Min | AccOp::Max => {
                if value.is_null() {
                    return;
                }
                let replace = match &self.best {
                    None => true,
                    Some(best) => match compare(&value, best) {
                        Some(ord) if op == AccOp::Min => ord.is_lt(),
                        Some(ord) => ord.is_gt(),
                        None => false,
                    },
                };
                if replace {
                    self.best = Some(value);
                }
            }
            AccOp::First => {}
            AccOp::Push => self.items.push(value),
        }
    }

    fn finish(self, op: AccOp) -> Value {
        let total = || {
            if self.all_int {
                Value::from(self.int_sum)
            } else {
                serde_json::Number::from_f64(self.float_sum).map_or(Value::Null, Value::Number)
            }
        };
        match op {
            AccOp::Sum if self.count == 0 => Value::from(0),
            AccOp::Sum => total(),
            AccOp::Avg if self.count == 0 => Value::Null,
            AccOp::Avg => {
                let sum = if self.all_int {
                    self.int_sum as f64
                } else {
                    self.float_sum
                };
                serde_json::Number::from_f64(sum / self.count as f64).map_or(Value::Null, Value::Number)
            }
            AccOp::Min | AccOp::Max => self.best.unwrap_or(Value::Null),
            AccOp::First => self.first.unwrap_or(Value::Null),
            AccOp::Push => Value::Array(self.items),
        }
    }
}

fn group(
    docs: Vec<Document>,
    key: &crate::plan::Expr,
    fields: &[(String, Accumulator)],
    ctx: Option<&ResourceId>,
) -> Result<Vec<Document>> {
    let mut groups: BTreeMap<String, (Value, Vec<Acc>)> = BTreeMap::new();
    let mut order = Vec::new();
    for doc in &docs {
        let key_value = evaluate(doc, key, ctx)?;
        let key_text = key_value.to_string();
        let entry = groups.entry(key_text.clone()).or_insert_with(|| {
            order.push(key_text);
            (key_value, fields.iter().map(|_| Acc::default()).collect())
        });
        for ((_, acc), state) in fields.iter().zip(entry.1.iter_mut()) {
            state.add(acc.op, evaluate(doc, &acc.expr, ctx)?);
        }
    }

    let mut out = Vec::with_capacity(order.len());
    for key_text in order {
        if let Some((key_value, states)) = groups.remove(&key_text) {
            let mut doc = Map::new();
            doc.insert(ID.to_string(), key_value);
            for ((name, acc), state) in fields.iter().zip(states) {
                doc.insert(name.clone(), state.finish(acc.op));
            }
            out.push(doc);
        }
    }
    Ok(out)
}
