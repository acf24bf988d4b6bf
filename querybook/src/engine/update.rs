use super::numeric::Num;
use super::value::{get_path, remove_path, set_path, type_name};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set { path: String, value: Value },
    Unset { path: String },
    Inc { path: String, amount: Value, currency: bool },
    Mul { path: String, factor: Value, currency: bool },
    Push { path: String, value: Value },
}

impl UpdateOp {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateOp::Set { .. } => "$set",
            UpdateOp::Unset { .. } => "$unset",
            UpdateOp::Inc { .. } => "$inc",
            UpdateOp::Mul { .. } => "$mul",
            UpdateOp::Push { .. } => "$push",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            UpdateOp::Set { path, .. }
            | UpdateOp::Unset { path }
            | UpdateOp::Inc { path, .. }
            | UpdateOp::Mul { path, .. }
            | UpdateOp::Push { path, .. } => path,
        }
    }
}

/// Compiled update document, applied in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDoc {
    pub ops: Vec<UpdateOp>,
}

impl UpdateDoc {
    pub fn new(ops: Vec<UpdateOp>) -> Self {
        UpdateDoc { ops }
    }

    /// Apply every operator to `doc`. Returns whether the document changed.
    pub fn apply(&self, doc: &mut Value) -> Result<bool, String> {
        let before = doc.clone();
        for op in &self.ops {
            apply_op(op, doc)?;
        }
        Ok(*doc != before)
    }
}

fn arithmetic(
    doc: &mut Value,
    path: &str,
    operand: &Value,
    currency: bool,
    op: &'static str,
) -> Result<(), String> {
    let operand = Num::from_value(operand, currency)
        .ok_or_else(|| format!("Cannot {op} with non-numeric argument: {operand}"))?;
    let current = match get_path(doc, path) {
        None => None,
        Some(value) => Some(Num::from_value(value, currency).ok_or_else(|| {
            format!(
                "Cannot apply {op} to a value of non-numeric type. Field '{path}' has non-numeric type {}",
                type_name(value)
            )
        })?),
    };
    let result = match (op, current) {
        ("$inc", Some(current)) => current.add(operand)?,
        ("$inc", None) => operand,
        (_, Some(current)) => current.mul(operand)?,
        // $mul on a missing field stores zero
        (_, None) => Num::Int(0).mul(operand)?,
    };
    set_path(doc, path, result.to_value())
}

fn apply_op(op: &UpdateOp, doc: &mut Value) -> Result<(), String> {
    match op {
        UpdateOp::Set { path, value } => set_path(doc, path, value.clone()),
        UpdateOp::Unset { path } => {
            remove_path(doc, path);
            Ok(())
        }
        UpdateOp::Inc {
            path,
            amount,
            currency,
        } => arithmetic(doc, path, amount, *currency, "$inc"),
        UpdateOp::Mul {
            path,
            factor,
            currency,
        } => arithmetic(doc, path, factor, *currency, "$mul"),
        UpdateOp::Push { path, value } => match get_path(doc, path) {
            None => set_path(doc, path, Value::Array(vec![value.clone()])),
            Some(Value::Array(items)) => {
                let mut items = items.clone();
                items.push(value.clone());
                set_path(doc, path, Value::Array(items))
            }
            Some(other) => Err(format!(
                "The field '{path}' must be an array but is of type {}",
                type_name(other)
            )),
        },
    }
}
