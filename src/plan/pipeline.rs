use serde_json::{Value, json};

/// Comparison operators usable in filters and expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    #[must_use]
    pub const fn mongo(self) -> &'static str {
        match self {
            CmpOp::Eq => "$eq",
            CmpOp::Ne => "$ne",
            CmpOp::Gt => "$gt",
            CmpOp::Gte => "$gte",
            CmpOp::Lt => "$lt",
            CmpOp::Lte => "$lte",
        }
    }
}

/// A document predicate. Paths are dotted and traverse arrays; a comparison
/// against an array path holds when any element satisfies it.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Cmp { field: String, op: CmpOp, value: Value },
    /// Case-insensitive regular expression match.
    Regex { field: String, pattern: String },
    In { field: String, values: Vec<Value> },
    Exists { field: String, exists: bool },
    /// String field starts with the given prefix.
    Prefix { field: String, prefix: String },
    /// Field equals the id the pipeline is executed for.
    Context(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            field: field.to_string(),
            op: CmpOp::Eq,
            value: value.into(),
        }
    }

    pub fn is_in(field: &str, values: Vec<Value>) -> Self {
        Filter::In {
            field: field.to_string(),
            values,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Filter::Cmp { field, op, value } => json!({ field: { op.mongo(): value } }),
            Filter::Regex { field, pattern } => {
                json!({ field: { "$regex": pattern, "$options": "i" } })
            }
            Filter::In { field, values } => json!({ field: { "$in": values } }),
            Filter::Exists { field, exists } => json!({ field: { "$exists": exists } }),
            Filter::Prefix { field, prefix } => {
                json!({ field: { "$regex": format!("^{}", regex::escape(prefix)) } })
            }
            Filter::Context(field) => json!({ field: "$$ctx" }),
            Filter::And(parts) => json!({ "$and": parts.iter().map(Filter::to_json).collect::<Vec<_>>() }),
            Filter::Or(parts) => json!({ "$or": parts.iter().map(Filter::to_json).collect::<Vec<_>>() }),
        }
    }
}

/// Value expressions evaluated against a single document.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    /// The id the pipeline is executed for.
    Context,
    Add(Box<Expr>, Box<Expr>),
    Subtract(Box<Expr>, Box<Expr>),
    Multiply(Box<Expr>, Box<Expr>),
    Divide(Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    Concat(Box<Expr>, Box<Expr>),
    /// Datetime shifted by a millisecond duration.
    DateAdd(Box<Expr>, Box<Expr>),
    /// Millisecond difference between two datetimes.
    DateDiff(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Regex(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cond {
        when: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Switch {
        branches: Vec<(Expr, Expr)>,
        default: Box<Expr>,
    },
    IfNull(Box<Expr>, Box<Expr>),
    ArrayElemAt(Box<Expr>, i64),
    Round(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn field(path: &str) -> Self {
        Expr::Field(path.to_string())
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let pair = |op: &str, a: &Expr, b: &Expr| json!({ op: [a.to_json(), b.to_json()] });
        match self {
            Expr::Literal(v) => json!({ "$literal": v }),
            Expr::Field(path) => Value::String(format!("${path}")),
            Expr::Context => Value::String("$$ctx".into()),
            Expr::Add(a, b) => pair("$add", a, b),
            Expr::Subtract(a, b) => pair("$subtract", a, b),
            Expr::Multiply(a, b) => pair("$multiply", a, b),
            Expr::Divide(a, b) => pair("$divide", a, b),
            Expr::Negate(a) => json!({ "$multiply": [a.to_json(), -1] }),
            Expr::Concat(a, b) => pair("$concat", a, b),
            Expr::DateAdd(a, b) => {
                json!({ "$dateAdd": { "startDate": a.to_json(), "unit": "millisecond", "amount": b.to_json() } })
            }
            Expr::DateDiff(a, b) => {
                json!({ "$dateDiff": { "startDate": b.to_json(), "endDate": a.to_json(), "unit": "millisecond" } })
            }
            Expr::Cmp(op, a, b) => pair(op.mongo(), a, b),
            Expr::Regex(a, b) => {
                json!({ "$regexMatch": { "input": a.to_json(), "regex": b.to_json(), "options": "i" } })
            }
            Expr::And(a, b) => pair("$and", a, b),
            Expr::Or(a, b) => pair("$or", a, b),
            Expr::Cond {
                when,
                then,
                otherwise,
            } => json!({ "$cond": [when.to_json(), then.to_json(), otherwise.to_json()] }),
            Expr::Switch { branches, default } => json!({
                "$switch": {
                    "branches": branches
                        .iter()
                        .map(|(case, then)| json!({ "case": case.to_json(), "then": then.to_json() }))
                        .collect::<Vec<_>>(),
                    "default": default.to_json(),
                }
            }),
            Expr::IfNull(a, b) => pair("$ifNull", a, b),
            Expr::ArrayElemAt(a, i) => json!({ "$arrayElemAt": [a.to_json(), i] }),
            Expr::Round(a, b) => pair("$round", a, b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccOp {
    Sum,
    Min,
    Max,
    Avg,
    First,
    Push,
}

impl AccOp {
    #[must_use]
    pub const fn mongo(self) -> &'static str {
        match self {
            AccOp::Sum => "$sum",
            AccOp::Min => "$min",
            AccOp::Max => "$max",
            AccOp::Avg => "$avg",
            AccOp::First => "$first",
            AccOp::Push => "$push",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    pub op: AccOp,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    AddFields(Vec<(String, Expr)>),
    /// Joins resources of type `from` whose `foreign_field` matches this
    /// document's `local_field` into the array field `as_field`.
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    /// Runs an independent sub-pipeline and stores its output in `as_field`.
    LookupPipeline { pipeline: Pipeline, as_field: String },
    Group {
        key: Expr,
        fields: Vec<(String, Accumulator)>,
    },
    Unwind(String),
    ReplaceRoot(String),
    Project(Vec<String>),
    Sort(Vec<(String, bool)>),
    Skip(usize),
    Limit(usize),
}

impl Stage {
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Stage::Match(filter) => json!({ "$match": filter.to_json() }),
            Stage::AddFields(fields) => {
                let map: serde_json::Map<String, Value> = fields
                    .iter()
                    .map(|(name, expr)| (name.clone(), expr.to_json()))
                    .collect();
                json!({ "$addFields": map })
            }
            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
            } => json!({
                "$lookup": {
                    "from": from,
                    "localField": local_field,
                    "foreignField": foreign_field,
                    "as": as_field,
                }
            }),
            Stage::LookupPipeline { pipeline, as_field } => json!({
                "$lookup": { "pipeline": pipeline.to_json(), "as": as_field }
            }),
            Stage::Group { key, fields } => {
                let mut map = serde_json::Map::new();
                map.insert("_id".into(), key.to_json());
                for (name, acc) in fields {
                    map.insert(name.clone(), json!({ acc.op.mongo(): acc.expr.to_json() }));
                }
                json!({ "$group": map })
            }
            Stage::Unwind(field) => json!({ "$unwind": format!("${field}") }),
            Stage::ReplaceRoot(field) => json!({ "$replaceRoot": { "newRoot": format!("${field}") } }),
            Stage::Project(fields) => {
                let map: serde_json::Map<String, Value> =
                    fields.iter().map(|f| (f.clone(), json!(1))).collect();
                json!({ "$project": map })
            }
            Stage::Sort(keys) => {
                let map: serde_json::Map<String, Value> = keys
                    .iter()
                    .map(|(f, asc)| (f.clone(), json!(if *asc { 1 } else { -1 })))
                    .collect();
                json!({ "$sort": map })
            }
            Stage::Skip(n) => json!({ "$skip": n }),
            Stage::Limit(n) => json!({ "$limit": n }),
        }
    }
}

/// An ordered list of stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn extend(&mut self, stages: impl IntoIterator<Item = Stage>) {
        self.stages.extend(stages);
    }

    #[must_use]
    pub fn with(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Array(self.stages.iter().map(Stage::to_json).collect())
    }
}

/// Lookup followed by the unwind/replace-root flatten, so later stages see
/// the joined resources as documents.
pub fn hop(from: &str, local_field: &str, foreign_field: &str) -> Vec<Stage> {
    const HOP: &str = "_lookup";
    vec![
        Stage::Lookup {
            from: from.to_string(),
            local_field: local_field.to_string(),
            foreign_field: foreign_field.to_string(),
            as_field: HOP.to_string(),
        },
        Stage::Unwind(HOP.to_string()),
        Stage::ReplaceRoot(HOP.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_renders_lookup_unwind_replace() {
        let pipeline = Pipeline {
            stages: hop("division", "division", "_id"),
        };
        assert_eq!(
            pipeline.to_json(),
            json!([
                {"$lookup": {"from": "division", "localField": "division", "foreignField": "_id", "as": "_lookup"}},
                {"$unwind": "$_lookup"},
                {"$replaceRoot": {"newRoot": "$_lookup"}},
            ])
        );
    }

    #[test]
    fn test_filter_rendering() {
        let filter = Filter::Or(vec![
            Filter::Cmp {
                field: "age".into(),
                op: CmpOp::Gt,
                value: json!(30),
            },
            Filter::Regex {
                field: "name".into(),
                pattern: "^b".into(),
            },
        ]);
        assert_eq!(
            filter.to_json(),
            json!({"$or": [{"age": {"$gt": 30}}, {"name": {"$regex": "^b", "$options": "i"}}]})
        );
        assert_eq!(Filter::Context("_id".into()).to_json(), json!({"_id": "$$ctx"}));
    }

    #[test]
    fn test_arithmetic_rendering() {
        let expr = Expr::Add(
            Box::new(Expr::IfNull(Box::new(Expr::field("a")), Box::new(Expr::lit(0)))),
            Box::new(Expr::lit(1)),
        );
        assert_eq!(
            expr.to_json(),
            json!({"$add": [{"$ifNull": ["$a", {"$literal": 0}]}, {"$literal": 1}]})
        );
    }
}
