use super::expr::{Datum, Expr};
use super::filter::Filter;
use super::numeric::Num;
use super::value::{
    canonical_key, compare_values, copy_path, expression_path, get_path, match_candidates, remove_path,
    set_path, values_equal,
};
use super::Deadline;
use crate::error::{QueryBookError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Source of whole collections for stages that read other collections (`$lookup`).
pub trait CollectionSource {
    fn scan(&self, collection: &str, deadline: &Deadline) -> Result<Vec<Value>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub path: String,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub enum ProjectField {
    Include,
    Exclude,
    Computed(Expr),
}

#[derive(Debug, Clone)]
pub struct ProjectSpec {
    pub include_id: bool,
    pub fields: Vec<(String, ProjectField)>,
}

impl ProjectSpec {
    /// Inclusion mode unless every non-`_id` entry is an exclusion.
    pub fn is_inclusion(&self) -> bool {
        self.fields
            .iter()
            .any(|(_, field)| !matches!(field, ProjectField::Exclude))
    }
}

#[derive(Debug, Clone)]
pub struct UnwindSpec {
    pub path: String,
    pub preserve_null_and_empty: bool,
    pub include_array_index: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorKind {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    Count,
}

impl AccumulatorKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "$sum" => AccumulatorKind::Sum,
            "$avg" => AccumulatorKind::Avg,
            "$min" => AccumulatorKind::Min,
            "$max" => AccumulatorKind::Max,
            "$first" => AccumulatorKind::First,
            "$last" => AccumulatorKind::Last,
            "$push" => AccumulatorKind::Push,
            "$addToSet" => AccumulatorKind::AddToSet,
            "$count" => AccumulatorKind::Count,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone)]
pub struct Accumulator {
    pub kind: AccumulatorKind,
    /// Ignored for `$count`.
    pub expr: Expr,
}

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub key: Expr,
    pub accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

/// One native aggregation stage.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Filter),
    Project(ProjectSpec),
    AddFields(Vec<(String, Expr)>),
    Unwind(UnwindSpec),
    Group(GroupSpec),
    Sort(Vec<SortKey>),
    Limit(usize),
    Skip(usize),
    Lookup(LookupSpec),
    Count(String),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Unwind(_) => "$unwind",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Lookup(_) => "$lookup",
            Stage::Count(_) => "$count",
        }
    }
}

/// Ordered stage list. Stages run exactly in the declared order.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Pipeline { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }
}

/// Run `pipeline` over `input`. Errors raised by a stage carry its index.
pub fn run_pipeline(
    input: Vec<Value>,
    pipeline: &Pipeline,
    source: &dyn CollectionSource,
    deadline: &Deadline,
) -> Result<Vec<Value>> {
    let mut docs = input;
    for (index, stage) in pipeline.stages.iter().enumerate() {
        deadline.check()?;
        docs = run_stage(docs, stage, source, deadline).map_err(|e| match e {
            StageError::Eval(message) => QueryBookError::Execution {
                stage: Some(index),
                message: format!("{}: {message}", stage.name()),
            },
            StageError::Store(err) => err,
        })?;
        log::trace!("stage {index} {} -> {} documents", stage.name(), docs.len());
    }
    Ok(docs)
}

enum StageError {
    Eval(String),
    Store(QueryBookError),
}

impl From<String> for StageError {
    fn from(message: String) -> Self {
        StageError::Eval(message)
    }
}

impl From<QueryBookError> for StageError {
    fn from(err: QueryBookError) -> Self {
        StageError::Store(err)
    }
}

fn run_stage(
    docs: Vec<Value>,
    stage: &Stage,
    source: &dyn CollectionSource,
    deadline: &Deadline,
) -> std::result::Result<Vec<Value>, StageError> {
    match stage {
        Stage::Match(filter) => {
            let mut out = Vec::new();
            for doc in docs {
                if filter.matches(&doc)? {
                    out.push(doc);
                }
            }
            Ok(out)
        }
        Stage::Project(spec) => Ok(docs
            .iter()
            .map(|doc| project(doc, spec))
            .collect::<std::result::Result<Vec<_>, String>>()?),
        Stage::AddFields(fields) => {
            let mut out = Vec::with_capacity(docs.len());
            for mut doc in docs {
                for (path, expr) in fields {
                    let value = expr.eval(&doc)?;
                    if !value.is_missing() {
                        set_path(&mut doc, path, value.into_value())?;
                    }
                }
                out.push(doc);
            }
            Ok(out)
        }
        Stage::Unwind(spec) => Ok(unwind(docs, spec)?),
        Stage::Group(spec) => Ok(group(docs, spec)?),
        Stage::Sort(keys) => {
            let mut docs = docs;
            sort_documents(&mut docs, keys);
            Ok(docs)
        }
        Stage::Limit(n) => Ok(docs.into_iter().take(*n).collect()),
        Stage::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
        Stage::Lookup(spec) => {
            let foreign = source.scan(&spec.from, deadline)?;
            Ok(lookup(docs, spec, &foreign)?)
        }
        Stage::Count(field) => {
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut map = Map::new();
            map.insert(field.clone(), Value::from(docs.len() as u64));
            Ok(vec![Value::Object(map)])
        }
    }
}

fn project(doc: &Value, spec: &ProjectSpec) -> std::result::Result<Value, String> {
    if !spec.is_inclusion() {
        let mut out = doc.clone();
        if !spec.include_id {
            remove_path(&mut out, "_id");
        }
        for (path, _) in &spec.fields {
            remove_path(&mut out, path);
        }
        return Ok(out);
    }

    let mut out = Map::new();
    if spec.include_id {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    let mut out = Value::Object(out);
    for (path, field) in &spec.fields {
        match field {
            ProjectField::Include => {
                if let Value::Object(map) = &mut out {
                    copy_path(doc, map, path);
                }
            }
            ProjectField::Computed(expr) => {
                let value = expr.eval(doc)?;
                if !value.is_missing() {
                    set_path(&mut out, path, value.into_value())?;
                }
            }
            ProjectField::Exclude => {}
        }
    }
    Ok(out)
}

fn unwind(docs: Vec<Value>, spec: &UnwindSpec) -> std::result::Result<Vec<Value>, String> {
    let mut out = Vec::new();
    for doc in docs {
        let items = match get_path(&doc, &spec.path) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(single) => vec![single.clone()],
        };
        if items.is_empty() {
            if spec.preserve_null_and_empty {
                let mut kept = doc;
                if let Some(index_field) = &spec.include_array_index {
                    set_path(&mut kept, index_field, Value::Null)?;
                }
                out.push(kept);
            }
            continue;
        }
        for (index, item) in items.into_iter().enumerate() {
            let mut copy = doc.clone();
            set_path(&mut copy, &spec.path, item)?;
            if let Some(index_field) = &spec.include_array_index {
                set_path(&mut copy, index_field, Value::from(index as u64))?;
            }
            out.push(copy);
        }
    }
    Ok(out)
}

/// Running state of one accumulator within one group.
enum AccState {
    Sum(Num),
    Avg { sum: Num, count: i64 },
    Extreme(Option<Value>),
    First(Option<Value>),
    Last(Value),
    List(Vec<Value>),
}

impl AccState {
    fn new(kind: AccumulatorKind) -> Self {
        match kind {
            AccumulatorKind::Sum | AccumulatorKind::Count => AccState::Sum(Num::Int(0)),
            AccumulatorKind::Avg => AccState::Avg {
                sum: Num::Int(0),
                count: 0,
            },
            AccumulatorKind::Min | AccumulatorKind::Max => AccState::Extreme(None),
            AccumulatorKind::First => AccState::First(None),
            AccumulatorKind::Last => AccState::Last(Value::Null),
            AccumulatorKind::Push | AccumulatorKind::AddToSet => AccState::List(Vec::new()),
        }
    }

    fn update(&mut self, acc: &Accumulator, doc: &Value) -> std::result::Result<(), String> {
        if acc.kind == AccumulatorKind::Count {
            if let AccState::Sum(total) = self {
                *total = total.add(Num::Int(1))?;
            }
            return Ok(());
        }
        let datum = acc.expr.eval(doc)?;
        match self {
            AccState::Sum(total) => {
                if let Datum::Num(n) = datum {
                    *total = total.add(n)?;
                }
            }
            AccState::Avg { sum, count } => {
                if let Datum::Num(n) = datum {
                    *sum = sum.add(n)?;
                    *count += 1;
                }
            }
            AccState::Extreme(current) => {
                let value = datum.into_value();
                if value.is_null() {
                    return Ok(());
                }
                let replace = match current {
                    None => true,
                    Some(existing) => {
                        let ord = compare_values(&value, existing);
                        if acc.kind == AccumulatorKind::Min {
                            ord.is_lt()
                        } else {
                            ord.is_gt()
                        }
                    }
                };
                if replace {
                    *current = Some(value);
                }
            }
            AccState::First(first) => {
                if first.is_none() {
                    *first = Some(datum.into_value());
                }
            }
            AccState::Last(last) => *last = datum.into_value(),
            AccState::List(items) => {
                if datum.is_missing() {
                    return Ok(());
                }
                let value = datum.into_value();
                if acc.kind == AccumulatorKind::AddToSet
                    && items.iter().any(|existing| values_equal(existing, &value))
                {
                    return Ok(());
                }
                items.push(value);
            }
        }
        Ok(())
    }

    fn finish(self) -> std::result::Result<Value, String> {
        Ok(match self {
            AccState::Sum(total) => total.to_value(),
            AccState::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    sum.div(Num::Int(count))
                        .map(|avg| match avg {
                            Num::Fixed(_) => avg,
                            other => Num::Float(other.as_f64()),
                        })?
                        .to_value()
                }
            }
            AccState::Extreme(value) | AccState::First(value) => value.unwrap_or(Value::Null),
            AccState::Last(value) => value,
            AccState::List(items) => Value::Array(items),
        })
    }
}

fn group(docs: Vec<Value>, spec: &GroupSpec) -> std::result::Result<Vec<Value>, String> {
    let mut keys: Vec<Value> = Vec::new();
    let mut states: Vec<Vec<AccState>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for doc in &docs {
        let key = spec.key.eval(doc)?.into_value();
        let canonical = canonical_key(&key);
        let slot = match index.get(&canonical) {
            Some(&slot) => slot,
            None => {
                index.insert(canonical, keys.len());
                keys.push(key);
                states.push(
                    spec.accumulators
                        .iter()
                        .map(|(_, acc)| AccState::new(acc.kind))
                        .collect(),
                );
                keys.len() - 1
            }
        };
        for (state, (_, acc)) in states[slot].iter_mut().zip(&spec.accumulators) {
            state.update(acc, doc)?;
        }
    }

    let mut out = Vec::with_capacity(keys.len());
    for (key, group_states) in keys.into_iter().zip(states) {
        let mut map = Map::new();
        map.insert("_id".to_string(), key);
        for (state, (name, _)) in group_states.into_iter().zip(&spec.accumulators) {
            map.insert(name.clone(), state.finish()?);
        }
        out.push(Value::Object(map));
    }
    Ok(out)
}

/// Stable multi-key sort; missing fields sort as null.
pub fn sort_documents(docs: &mut [Value], keys: &[SortKey]) {
    docs.sort_by(|a, b| {
        for key in keys {
            let left = get_path(a, &key.path).unwrap_or(&Value::Null);
            let right = get_path(b, &key.path).unwrap_or(&Value::Null);
            let ord = compare_values(left, right);
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord.is_ne() {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn lookup(
    docs: Vec<Value>,
    spec: &LookupSpec,
    foreign: &[Value],
) -> std::result::Result<Vec<Value>, String> {
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let locals = match expression_path(&doc, &spec.local_field) {
            Some(Value::Array(items)) => items,
            Some(value) => vec![value],
            None => vec![Value::Null],
        };
        let joined: Vec<Value> = foreign
            .iter()
            .filter(|candidate| {
                let values = match_candidates(candidate, &spec.foreign_field);
                locals.iter().any(|local| {
                    if values.is_empty() {
                        return local.is_null();
                    }
                    values.iter().any(|value| values_equal(value, local))
                })
            })
            .cloned()
            .collect();
        set_path(&mut doc, &spec.as_field, Value::Array(joined))?;
        out.push(doc);
    }
    Ok(out)
}
