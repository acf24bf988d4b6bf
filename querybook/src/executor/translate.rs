//! Translation of catalog JSON into the store's native representation.
//!
//! The translator knows the full operator subset; the store's
//! [`Capabilities`] narrow it further. Anything outside either is a
//! [`QueryBookError::Translation`].

use crate::engine::value::normalize_literal;
use crate::engine::{
    Accumulator, AccumulatorKind, Expr, FieldPredicate, Filter, FindQuery, GroupSpec, LookupSpec,
    Operator, Pipeline, Predicate, ProjectField, ProjectSpec, SortKey, Stage, UnwindSpec,
    UpdateDoc, UpdateOp,
};
use crate::error::{QueryBookError, Result};
use crate::schema::SchemaRegistry;
use crate::store::Capabilities;
use crate::validation::{field_reference, operator_of, projection_flag, Shape};
use regex::RegexBuilder;
use serde_json::{Map, Value};

fn err<T>(message: impl Into<String>) -> Result<T> {
    Err(QueryBookError::Translation(message.into()))
}

fn literal(value: &Value) -> Result<Value> {
    normalize_literal(value).map_err(QueryBookError::Translation)
}

fn as_count(value: &Value, what: &str) -> Result<usize> {
    match value.as_u64() {
        Some(n) => Ok(n as usize),
        None => match value.as_f64() {
            Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as usize),
            _ => err(format!("{what} requires a non-negative integer, got {value}")),
        },
    }
}

/// Extended-JSON literals like `{"$date": ..}` are values, not operators.
fn is_extended_literal(map: &Map<String, Value>) -> bool {
    map.len() == 1 && (map.contains_key("$date") || map.contains_key("$oid"))
}

pub struct Translator<'a> {
    registry: &'a SchemaRegistry,
    capabilities: &'a Capabilities,
}

impl<'a> Translator<'a> {
    pub fn new(registry: &'a SchemaRegistry, capabilities: &'a Capabilities) -> Self {
        Translator {
            registry,
            capabilities,
        }
    }

    // ── Filters ──────────────────────────────────────────────────────

    pub fn filter(&self, filter: &Value, shape: &Shape) -> Result<Filter> {
        let Value::Object(map) = filter else {
            return err(format!("filter must be a document, got {filter}"));
        };
        let mut parts = Vec::new();
        for (key, value) in map {
            let part = match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let Some(items) = value.as_array().filter(|items| !items.is_empty()) else {
                        return err(format!("{key} requires a non-empty array"));
                    };
                    let filters = items
                        .iter()
                        .map(|item| self.filter(item, shape))
                        .collect::<Result<Vec<_>>>()?;
                    match key.as_str() {
                        "$and" => Filter::And(filters),
                        "$or" => Filter::Or(filters),
                        _ => Filter::Nor(filters),
                    }
                }
                "$expr" => Filter::Expr(self.expr(value, shape)?),
                op if op.starts_with('$') => {
                    return err(format!("unsupported query operator '{op}'"))
                }
                path => self.field_filter(path, value, shape)?,
            };
            parts.push(part);
        }
        Ok(match parts.len() {
            0 => Filter::All,
            1 => parts.remove(0),
            _ => Filter::And(parts),
        })
    }

    fn field_filter(&self, path: &str, value: &Value, shape: &Shape) -> Result<Filter> {
        let currency = shape.is_currency(path);
        let field = |predicate| {
            Filter::Field(FieldPredicate {
                path: path.to_string(),
                predicate,
                currency,
            })
        };

        let operators = match value {
            Value::Object(map)
                if !map.is_empty()
                    && !is_extended_literal(map)
                    && map.keys().all(|k| k.starts_with('$')) =>
            {
                map
            }
            other => return Ok(field(Predicate::Eq(literal(other)?))),
        };

        let mut predicates = Vec::new();
        for (op, arg) in operators {
            if op == "$options" {
                if !operators.contains_key("$regex") {
                    return err("$options needs a $regex");
                }
                continue;
            }
            predicates.push(field(self.predicate(op, arg, operators.get("$options"))?));
        }
        Ok(if predicates.len() == 1 {
            predicates.remove(0)
        } else {
            Filter::And(predicates)
        })
    }

    fn predicate(&self, op: &str, arg: &Value, options: Option<&Value>) -> Result<Predicate> {
        let predicate = match op {
            "$eq" => Predicate::Eq(literal(arg)?),
            "$ne" => Predicate::Ne(literal(arg)?),
            "$gt" => Predicate::Gt(literal(arg)?),
            "$gte" => Predicate::Gte(literal(arg)?),
            "$lt" => Predicate::Lt(literal(arg)?),
            "$lte" => Predicate::Lte(literal(arg)?),
            "$in" | "$nin" => {
                let Some(items) = arg.as_array() else {
                    return err(format!("{op} requires an array"));
                };
                let items = items.iter().map(literal).collect::<Result<Vec<_>>>()?;
                if op == "$in" {
                    Predicate::In(items)
                } else {
                    Predicate::Nin(items)
                }
            }
            "$exists" => Predicate::Exists(match arg {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64() != Some(0.0),
                other => return err(format!("$exists requires a boolean, got {other}")),
            }),
            "$regex" => {
                let Some(pattern) = arg.as_str() else {
                    return err("$regex requires a string pattern");
                };
                let options = options.and_then(Value::as_str).unwrap_or_default();
                let mut builder = RegexBuilder::new(pattern);
                for flag in options.chars() {
                    match flag {
                        'i' => builder.case_insensitive(true),
                        'm' => builder.multi_line(true),
                        's' => builder.dot_matches_new_line(true),
                        'x' => builder.ignore_whitespace(true),
                        other => return err(format!("unsupported $regex option '{other}'")),
                    };
                }
                Predicate::Regex(
                    builder
                        .build()
                        .map_err(|e| QueryBookError::Translation(format!("invalid $regex: {e}")))?,
                )
            }
            "$size" => Predicate::Size(as_count(arg, "$size")?),
            "$minSize" => Predicate::MinSize(as_count(arg, "$minSize")?),
            "$not" => {
                let Some(map) = arg.as_object() else {
                    return err("$not requires an operator expression");
                };
                let mut inner = map.iter().filter(|(k, _)| k.as_str() != "$options");
                match (inner.next(), inner.next()) {
                    (Some((op, value)), None) => Predicate::Not(Box::new(self.predicate(
                        op,
                        value,
                        map.get("$options"),
                    )?)),
                    _ => return err("$not requires a single operator expression"),
                }
            }
            other => return err(format!("unsupported query operator '{other}'")),
        };
        Ok(predicate)
    }

    // ── Expressions ──────────────────────────────────────────────────

    pub fn expr(&self, expr: &Value, shape: &Shape) -> Result<Expr> {
        if let Some(path) = field_reference(expr) {
            return Ok(Expr::Field {
                path: path.to_string(),
                currency: shape.is_currency(path),
            });
        }
        match expr {
            Value::String(s) if s.starts_with("$$") => {
                err(format!("unsupported expression variable '{s}'"))
            }
            Value::Array(items) => Ok(Expr::Array(
                items
                    .iter()
                    .map(|item| self.expr(item, shape))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Value::Object(map) if is_extended_literal(map) => Ok(Expr::Literal(literal(expr)?)),
            Value::Object(map) => match operator_of(map) {
                Some((op, args)) => self.operator(op, args, shape),
                None => {
                    if let Some(key) = map.keys().find(|k| k.starts_with('$')) {
                        return err(format!(
                            "expression object mixes operator '{key}' with other fields"
                        ));
                    }
                    let entries = map
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), self.expr(v, shape)?)))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Expr::Object(entries))
                }
            },
            other => Ok(Expr::Literal(other.clone())),
        }
    }

    fn operator(&self, op: &str, args: &Value, shape: &Shape) -> Result<Expr> {
        match op {
            "$literal" => return Ok(Expr::Literal(args.clone())),
            "$cond" => {
                let (condition, then, otherwise) = match args {
                    Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                    Value::Object(map) => match (map.get("if"), map.get("then"), map.get("else")) {
                        (Some(c), Some(t), Some(e)) => (c, t, e),
                        _ => return err("$cond requires 'if', 'then' and 'else'"),
                    },
                    _ => return err("$cond requires three arguments"),
                };
                return Ok(Expr::Cond {
                    condition: Box::new(self.expr(condition, shape)?),
                    then: Box::new(self.expr(then, shape)?),
                    otherwise: Box::new(self.expr(otherwise, shape)?),
                });
            }
            "$switch" => {
                let Some(branches) = args.get("branches").and_then(Value::as_array) else {
                    return err("$switch requires a 'branches' array");
                };
                let branches = branches
                    .iter()
                    .map(|branch| match (branch.get("case"), branch.get("then")) {
                        (Some(case), Some(then)) => {
                            Ok((self.expr(case, shape)?, self.expr(then, shape)?))
                        }
                        _ => err("$switch branches need 'case' and 'then'"),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let default = match args.get("default") {
                    Some(default) => Some(Box::new(self.expr(default, shape)?)),
                    None => None,
                };
                return Ok(Expr::Switch { branches, default });
            }
            _ => {}
        }

        let Some(operator) = Operator::from_name(op) else {
            return err(format!("unsupported expression operator '{op}'"));
        };
        let args = match args {
            Value::Array(items) => items
                .iter()
                .map(|item| self.expr(item, shape))
                .collect::<Result<Vec<_>>>()?,
            single => vec![self.expr(single, shape)?],
        };
        let (min, max) = operator.arity();
        if args.len() < min || args.len() > max {
            return err(format!(
                "{op} does not accept {} argument{}",
                args.len(),
                if args.len() == 1 { "" } else { "s" }
            ));
        }
        Ok(Expr::Op {
            op: operator,
            args,
        })
    }

    // ── Projection and sort ──────────────────────────────────────────

    pub fn projection(&self, projection: &Value, shape: &Shape) -> Result<ProjectSpec> {
        let Value::Object(map) = projection else {
            return err(format!("projection must be a document, got {projection}"));
        };
        if map.is_empty() {
            return err("projection must specify at least one field");
        }
        let mut spec = ProjectSpec {
            include_id: true,
            fields: Vec::new(),
        };
        for (path, value) in map {
            let field = match projection_flag(value) {
                Some(flag) if path == "_id" => {
                    spec.include_id = flag;
                    continue;
                }
                Some(true) => ProjectField::Include,
                Some(false) => ProjectField::Exclude,
                None => {
                    if path == "_id" {
                        spec.include_id = false;
                    }
                    ProjectField::Computed(self.expr(value, shape)?)
                }
            };
            spec.fields.push((path.clone(), field));
        }

        let excludes = spec
            .fields
            .iter()
            .any(|(_, f)| matches!(f, ProjectField::Exclude));
        if excludes && spec.is_inclusion() {
            return err("projection cannot mix inclusion and exclusion");
        }
        Ok(spec)
    }

    pub fn sort(&self, sort: &Value) -> Result<Vec<SortKey>> {
        let Value::Object(map) = sort else {
            return err(format!("sort must be a document, got {sort}"));
        };
        map.iter()
            .map(|(path, direction)| match direction.as_i64() {
                Some(1) => Ok(SortKey {
                    path: path.clone(),
                    descending: false,
                }),
                Some(-1) => Ok(SortKey {
                    path: path.clone(),
                    descending: true,
                }),
                _ => err(format!("sort direction for '{path}' must be 1 or -1")),
            })
            .collect()
    }

    // ── Find ─────────────────────────────────────────────────────────

    pub fn find(
        &self,
        collection: &str,
        filter: &Value,
        projection: Option<&Value>,
        sort: Option<&Value>,
        skip: Option<u64>,
        limit: Option<u64>,
    ) -> Result<FindQuery> {
        let shape = Shape::of_collection(self.registry, collection);
        let mut query = FindQuery::new(self.filter(filter, &shape)?);
        if let Some(projection) = projection {
            query.projection = Some(self.projection(projection, &shape)?);
        }
        if let Some(sort) = sort {
            query.sort = self.sort(sort)?;
        }
        query.skip = skip.unwrap_or(0) as usize;
        query.limit = limit.filter(|&n| n > 0).map(|n| n as usize);
        Ok(query)
    }

    // ── Aggregation ──────────────────────────────────────────────────

    pub fn pipeline(&self, collection: &str, stages: &[Value]) -> Result<Pipeline> {
        let mut shape = Shape::of_collection(self.registry, collection);
        let mut native = Vec::with_capacity(stages.len());
        for (index, stage) in stages.iter().enumerate() {
            let Some((name, body)) = stage.as_object().and_then(operator_of) else {
                return err(format!(
                    "pipeline stage {index} must be a document with exactly one $-prefixed field"
                ));
            };
            let canonical = if name == "$set" { "$addFields" } else { name };
            if !self.capabilities.supports_stage(canonical) {
                return err(format!(
                    "stage {name} (pipeline[{index}]) is not supported by the configured store"
                ));
            }
            let stage = self.stage(canonical, body, &shape).map_err(|e| match e {
                QueryBookError::Translation(message) => {
                    QueryBookError::Translation(format!("pipeline[{index}] {name}: {message}"))
                }
                other => other,
            })?;
            native.push(stage);
            shape = shape.after_stage(name, body, self.registry);
        }
        Ok(Pipeline::new(native))
    }

    fn stage(&self, name: &str, body: &Value, shape: &Shape) -> Result<Stage> {
        let stage = match name {
            "$match" => Stage::Match(self.filter(body, shape)?),
            "$project" => Stage::Project(self.projection(body, shape)?),
            "$addFields" => {
                let Value::Object(map) = body else {
                    return err("$addFields requires a document");
                };
                Stage::AddFields(
                    map.iter()
                        .map(|(k, v)| Ok((k.clone(), self.expr(v, shape)?)))
                        .collect::<Result<Vec<_>>>()?,
                )
            }
            "$unwind" => Stage::Unwind(self.unwind(body)?),
            "$group" => Stage::Group(self.group(body, shape)?),
            "$sort" => Stage::Sort(self.sort(body)?),
            "$limit" => match as_count(body, "$limit")? {
                0 => return err("$limit must be positive"),
                n => Stage::Limit(n),
            },
            "$skip" => Stage::Skip(as_count(body, "$skip")?),
            "$lookup" => {
                let field = |key: &str| -> Result<String> {
                    body.get(key)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| QueryBookError::Translation(format!("$lookup requires '{key}'")))
                };
                Stage::Lookup(LookupSpec {
                    from: field("from")?,
                    local_field: field("localField")?,
                    foreign_field: field("foreignField")?,
                    as_field: field("as")?,
                })
            }
            "$count" => match body.as_str() {
                Some(name) if !name.is_empty() && !name.starts_with('$') => {
                    Stage::Count(name.to_string())
                }
                _ => return err("$count requires a non-empty field name"),
            },
            other => return err(format!("unsupported stage {other}")),
        };
        Ok(stage)
    }

    fn unwind(&self, body: &Value) -> Result<UnwindSpec> {
        let (path, preserve, index) = match body {
            Value::String(_) => (body, false, None),
            Value::Object(map) => (
                map.get("path").unwrap_or(&Value::Null),
                map.get("preserveNullAndEmptyArrays")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                map.get("includeArrayIndex")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            _ => (&Value::Null, false, None),
        };
        match field_reference(path) {
            Some(path) => Ok(UnwindSpec {
                path: path.to_string(),
                preserve_null_and_empty: preserve,
                include_array_index: index,
            }),
            None => err("$unwind path must be a '$'-prefixed field path"),
        }
    }

    fn group(&self, body: &Value, shape: &Shape) -> Result<GroupSpec> {
        let Value::Object(map) = body else {
            return err("$group requires a document");
        };
        let Some(key) = map.get("_id") else {
            return err("$group requires an '_id' key");
        };
        let mut accumulators = Vec::new();
        for (name, spec) in map {
            if name == "_id" {
                continue;
            }
            let Some((op, arg)) = spec.as_object().and_then(operator_of) else {
                return err(format!("accumulator '{name}' must be a single-operator document"));
            };
            let Some(kind) = AccumulatorKind::from_name(op) else {
                return err(format!("unsupported accumulator '{op}' for '{name}'"));
            };
            let expr = match kind {
                AccumulatorKind::Count => Expr::Literal(Value::Null),
                _ => self.expr(arg, shape)?,
            };
            accumulators.push((name.clone(), Accumulator { kind, expr }));
        }
        Ok(GroupSpec {
            key: self.expr(key, shape)?,
            accumulators,
        })
    }

    // ── Updates ──────────────────────────────────────────────────────

    pub fn update(&self, collection: &str, update: &Value) -> Result<UpdateDoc> {
        let shape = Shape::of_collection(self.registry, collection);
        let Value::Object(map) = update else {
            return err(format!("update must be a document, got {update}"));
        };
        if map.is_empty() {
            return err("update document is empty");
        }
        let mut ops = Vec::new();
        for (operator, targets) in map {
            if !operator.starts_with('$') {
                return err("replacement-style updates are not supported; use update operators");
            }
            if !self.capabilities.supports_update_operator(operator) {
                return err(format!(
                    "update operator {operator} is not supported by the configured store"
                ));
            }
            let Value::Object(targets) = targets else {
                return err(format!("{operator} requires a document of field paths"));
            };
            for (path, value) in targets {
                let path = path.clone();
                let currency = shape.is_currency(&path);
                let op = match operator.as_str() {
                    "$set" => UpdateOp::Set {
                        path,
                        value: literal(value)?,
                    },
                    "$unset" => UpdateOp::Unset { path },
                    "$inc" | "$mul" if !value.is_number() => {
                        return err(format!("{operator} on '{path}' requires a numeric operand"))
                    }
                    "$inc" => UpdateOp::Inc {
                        path,
                        amount: value.clone(),
                        currency,
                    },
                    "$mul" => UpdateOp::Mul {
                        path,
                        factor: value.clone(),
                        currency,
                    },
                    "$push" => UpdateOp::Push {
                        path,
                        value: literal(value)?,
                    },
                    other => return err(format!("unsupported update operator '{other}'")),
                };
                ops.push(op);
            }
        }
        Ok(UpdateDoc::new(ops))
    }

    pub fn update_filter(&self, collection: &str, filter: &Value) -> Result<Filter> {
        self.filter(filter, &Shape::of_collection(self.registry, collection))
    }
}
