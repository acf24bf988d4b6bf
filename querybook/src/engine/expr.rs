use super::numeric::Num;
use super::value::{compare_values, expression_path, parse_date, type_name, values_equal};
use chrono::Datelike;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Aggregation expression operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Round,
    Abs,
    Concat,
    ToUpper,
    ToLower,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    IfNull,
    Size,
    Year,
    Month,
    DayOfMonth,
    DayOfWeek,
}

impl Operator {
    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "$add" => Operator::Add,
            "$subtract" => Operator::Subtract,
            "$multiply" => Operator::Multiply,
            "$divide" => Operator::Divide,
            "$round" => Operator::Round,
            "$abs" => Operator::Abs,
            "$concat" => Operator::Concat,
            "$toUpper" => Operator::ToUpper,
            "$toLower" => Operator::ToLower,
            "$eq" => Operator::Eq,
            "$ne" => Operator::Ne,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$and" => Operator::And,
            "$or" => Operator::Or,
            "$not" => Operator::Not,
            "$ifNull" => Operator::IfNull,
            "$size" => Operator::Size,
            "$year" => Operator::Year,
            "$month" => Operator::Month,
            "$dayOfMonth" => Operator::DayOfMonth,
            "$dayOfWeek" => Operator::DayOfWeek,
            _ => return None,
        };
        Some(op)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operator::Add => "$add",
            Operator::Subtract => "$subtract",
            Operator::Multiply => "$multiply",
            Operator::Divide => "$divide",
            Operator::Round => "$round",
            Operator::Abs => "$abs",
            Operator::Concat => "$concat",
            Operator::ToUpper => "$toUpper",
            Operator::ToLower => "$toLower",
            Operator::Eq => "$eq",
            Operator::Ne => "$ne",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::And => "$and",
            Operator::Or => "$or",
            Operator::Not => "$not",
            Operator::IfNull => "$ifNull",
            Operator::Size => "$size",
            Operator::Year => "$year",
            Operator::Month => "$month",
            Operator::DayOfMonth => "$dayOfMonth",
            Operator::DayOfWeek => "$dayOfWeek",
        }
    }

    /// Accepted argument counts, inclusive.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Operator::Add | Operator::Multiply | Operator::Concat => (1, usize::MAX),
            Operator::And | Operator::Or => (0, usize::MAX),
            Operator::IfNull => (2, usize::MAX),
            Operator::Subtract
            | Operator::Divide
            | Operator::Eq
            | Operator::Ne
            | Operator::Gt
            | Operator::Gte
            | Operator::Lt
            | Operator::Lte => (2, 2),
            Operator::Round => (1, 2),
            _ => (1, 1),
        }
    }

    /// Whether the result is numeric and so inherits the currency flag of its inputs.
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            Operator::Add
                | Operator::Subtract
                | Operator::Multiply
                | Operator::Divide
                | Operator::Round
                | Operator::Abs
        )
    }
}

/// Compiled aggregation expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// `"$a.b"`; `currency` marks a fixed-point field
    Field { path: String, currency: bool },
    Literal(Value),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Op { op: Operator, args: Vec<Expr> },
    Cond {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Switch {
        branches: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },
}

/// An evaluated expression. Numbers stay in [`Num`] form between operators
/// so fixed-point results are not rounded through `f64` mid-computation.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Missing,
    Num(Num),
    Value(Value),
}

impl Datum {
    fn from_value(value: Value, currency: bool) -> Datum {
        match &value {
            Value::Number(n) => Datum::Num(Num::from_json(n, currency)),
            _ => Datum::Value(value),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Datum::Missing => Value::Null,
            Datum::Num(n) => n.to_value(),
            Datum::Value(v) => v,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Datum::Missing)
    }

    fn is_nullish(&self) -> bool {
        matches!(self, Datum::Missing | Datum::Value(Value::Null))
    }

    /// Aggregation truthiness: false, null, missing and zero are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Datum::Missing => false,
            Datum::Num(n) => !n.is_zero(),
            Datum::Value(Value::Null) | Datum::Value(Value::Bool(false)) => false,
            Datum::Value(_) => true,
        }
    }

    fn as_num(&self, op: Operator) -> Result<Option<Num>, String> {
        match self {
            Datum::Num(n) => Ok(Some(*n)),
            Datum::Missing | Datum::Value(Value::Null) => Ok(None),
            Datum::Value(other) => Err(format!(
                "{} only supports numeric types, not {}",
                op.name(),
                type_name(other)
            )),
        }
    }

    fn compare(&self, other: &Datum) -> Ordering {
        match (self, other) {
            (Datum::Num(a), Datum::Num(b)) => a.compare(*b),
            _ => compare_values(&self.clone().into_value(), &other.clone().into_value()),
        }
    }

    fn equals(&self, other: &Datum) -> bool {
        match (self, other) {
            (Datum::Num(a), Datum::Num(b)) => a.compare(*b) == Ordering::Equal,
            _ => values_equal(&self.clone().into_value(), &other.clone().into_value()),
        }
    }
}

impl Expr {
    pub fn field(path: &str) -> Expr {
        Expr::Field {
            path: path.to_string(),
            currency: false,
        }
    }

    pub fn literal(value: Value) -> Expr {
        Expr::Literal(value)
    }

    pub fn eval(&self, doc: &Value) -> Result<Datum, String> {
        match self {
            Expr::Field { path, currency } => Ok(match expression_path(doc, path) {
                Some(value) => Datum::from_value(value, *currency),
                None => Datum::Missing,
            }),
            Expr::Literal(value) => Ok(Datum::from_value(value.clone(), false)),
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, expr) in entries {
                    let datum = expr.eval(doc)?;
                    if !datum.is_missing() {
                        map.insert(key.clone(), datum.into_value());
                    }
                }
                Ok(Datum::Value(Value::Object(map)))
            }
            Expr::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| item.eval(doc).map(Datum::into_value))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Datum::Value(Value::Array(values)))
            }
            Expr::Cond {
                condition,
                then,
                otherwise,
            } => {
                if condition.eval(doc)?.is_truthy() {
                    then.eval(doc)
                } else {
                    otherwise.eval(doc)
                }
            }
            Expr::Switch { branches, default } => {
                for (case, then) in branches {
                    if case.eval(doc)?.is_truthy() {
                        return then.eval(doc);
                    }
                }
                match default {
                    Some(expr) => expr.eval(doc),
                    None => Err(
                        "$switch could not find a matching branch for an input, and no default was specified"
                            .to_string(),
                    ),
                }
            }
            Expr::Op { op, args } => eval_op(*op, args, doc),
        }
    }
}

fn eval_args(args: &[Expr], doc: &Value) -> Result<Vec<Datum>, String> {
    args.iter().map(|arg| arg.eval(doc)).collect()
}

/// Fold numeric arguments; any null or missing argument makes the result null.
fn fold_numeric(
    op: Operator,
    args: &[Expr],
    doc: &Value,
    combine: fn(Num, Num) -> Result<Num, String>,
) -> Result<Datum, String> {
    let mut acc: Option<Num> = None;
    for datum in eval_args(args, doc)? {
        let Some(n) = datum.as_num(op)? else {
            return Ok(Datum::Value(Value::Null));
        };
        acc = Some(match acc {
            None => n,
            Some(current) => combine(current, n)?,
        });
    }
    Ok(acc.map(Datum::Num).unwrap_or(Datum::Value(Value::Null)))
}

fn date_part(op: Operator, datum: Datum) -> Result<Datum, String> {
    let text = match &datum {
        Datum::Missing | Datum::Value(Value::Null) => return Ok(Datum::Value(Value::Null)),
        Datum::Value(Value::String(text)) => text.clone(),
        other => {
            return Err(format!(
                "{} can't convert from BSON type {} to Date",
                op.name(),
                type_name(&other.clone().into_value())
            ))
        }
    };
    let date = parse_date(&text)
        .ok_or_else(|| format!("{} can't parse '{text}' as a date", op.name()))?;
    let part = match op {
        Operator::Year => date.year() as i64,
        Operator::Month => date.month() as i64,
        Operator::DayOfMonth => date.day() as i64,
        // 1 = Sunday .. 7 = Saturday
        _ => date.weekday().number_from_sunday() as i64,
    };
    Ok(Datum::Num(Num::Int(part)))
}

fn eval_op(op: Operator, args: &[Expr], doc: &Value) -> Result<Datum, String> {
    match op {
        Operator::Add => fold_numeric(op, args, doc, Num::add),
        Operator::Multiply => fold_numeric(op, args, doc, Num::mul),
        Operator::Subtract => fold_numeric(op, args, doc, Num::sub),
        Operator::Divide => fold_numeric(op, args, doc, Num::div),
        Operator::Abs => {
            let datum = args[0].eval(doc)?;
            Ok(match datum.as_num(op)? {
                Some(n) => Datum::Num(n.abs()),
                None => Datum::Value(Value::Null),
            })
        }
        Operator::Round => {
            let datum = args[0].eval(doc)?;
            let places = match args.get(1) {
                Some(expr) => match expr.eval(doc)?.as_num(op)? {
                    Some(Num::Int(p)) => p as i32,
                    Some(other) if other.as_f64().fract() == 0.0 => other.as_f64() as i32,
                    _ => return Err("$round requires an integral place argument".to_string()),
                },
                None => 0,
            };
            Ok(match datum.as_num(op)? {
                Some(n) => Datum::Num(n.round(places)?),
                None => Datum::Value(Value::Null),
            })
        }
        Operator::Concat => {
            let mut out = String::new();
            for datum in eval_args(args, doc)? {
                match datum {
                    Datum::Missing | Datum::Value(Value::Null) => {
                        return Ok(Datum::Value(Value::Null))
                    }
                    Datum::Value(Value::String(s)) => out.push_str(&s),
                    other => {
                        return Err(format!(
                            "$concat only supports strings, not {}",
                            type_name(&other.into_value())
                        ))
                    }
                }
            }
            Ok(Datum::Value(Value::String(out)))
        }
        Operator::ToUpper | Operator::ToLower => {
            let text = match args[0].eval(doc)? {
                Datum::Missing | Datum::Value(Value::Null) => String::new(),
                Datum::Value(Value::String(s)) => s,
                other => other.into_value().to_string(),
            };
            Ok(Datum::Value(Value::String(if op == Operator::ToUpper {
                text.to_uppercase()
            } else {
                text.to_lowercase()
            })))
        }
        Operator::Eq | Operator::Ne => {
            let left = args[0].eval(doc)?;
            let right = args[1].eval(doc)?;
            let equal = left.equals(&right);
            Ok(Datum::Value(Value::Bool(if op == Operator::Eq { equal } else { !equal })))
        }
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let ord = args[0].eval(doc)?.compare(&args[1].eval(doc)?);
            let result = match op {
                Operator::Gt => ord == Ordering::Greater,
                Operator::Gte => ord != Ordering::Less,
                Operator::Lt => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            };
            Ok(Datum::Value(Value::Bool(result)))
        }
        Operator::And => {
            for arg in args {
                if !arg.eval(doc)?.is_truthy() {
                    return Ok(Datum::Value(Value::Bool(false)));
                }
            }
            Ok(Datum::Value(Value::Bool(true)))
        }
        Operator::Or => {
            for arg in args {
                if arg.eval(doc)?.is_truthy() {
                    return Ok(Datum::Value(Value::Bool(true)));
                }
            }
            Ok(Datum::Value(Value::Bool(false)))
        }
        Operator::Not => Ok(Datum::Value(Value::Bool(!args[0].eval(doc)?.is_truthy()))),
        Operator::IfNull => {
            let mut last = Datum::Value(Value::Null);
            for arg in args {
                last = arg.eval(doc)?;
                if !last.is_nullish() {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        Operator::Size => match args[0].eval(doc)? {
            Datum::Value(Value::Array(items)) => Ok(Datum::Num(Num::Int(items.len() as i64))),
            other => Err(format!(
                "The argument to $size must be an array. Type of argument: {}",
                if other.is_missing() {
                    "missing"
                } else {
                    type_name(&other.into_value())
                }
            )),
        },
        Operator::Year | Operator::Month | Operator::DayOfMonth | Operator::DayOfWeek => {
            date_part(op, args[0].eval(doc)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::numeric::Fixed;
    use serde_json::json;

    fn op(op: Operator, args: Vec<Expr>) -> Expr {
        Expr::Op { op, args }
    }

    fn money(path: &str) -> Expr {
        Expr::Field {
            path: path.to_string(),
            currency: true,
        }
    }

    #[test]
    fn test_currency_ratio_exact() {
        let doc = json!({"descuento": 50000.0, "subtotal": 400000.0});
        let ratio = op(Operator::Divide, vec![money("descuento"), money("subtotal")]);
        let datum = ratio.eval(&doc).unwrap();
        assert_eq!(datum, Datum::Num(Num::Fixed(Fixed::parse("0.125").unwrap())));
        assert_eq!(datum.into_value(), json!(0.125));
    }

    #[test]
    fn test_ratio_compared_with_float_literal() {
        let doc = json!({"descuento": 50000.0, "subtotal": 400000.0});
        let check = op(
            Operator::Gt,
            vec![
                op(Operator::Divide, vec![money("descuento"), money("subtotal")]),
                Expr::literal(json!(0.10)),
            ],
        );
        assert!(check.eval(&doc).unwrap().is_truthy());
    }

    #[test]
    fn test_chained_currency_arithmetic() {
        let doc = json!({"a": 0.1, "b": 0.2});
        let sum = op(Operator::Add, vec![money("a"), money("b")]);
        let eq = op(Operator::Eq, vec![sum, Expr::literal(json!(0.3))]);
        assert_eq!(eq.eval(&doc).unwrap(), Datum::Value(json!(true)));

        let plain = op(Operator::Add, vec![Expr::field("a"), Expr::field("b")]);
        let eq_plain = op(Operator::Eq, vec![plain, Expr::literal(json!(0.3))]);
        assert_eq!(eq_plain.eval(&doc).unwrap(), Datum::Value(json!(false)));
    }

    #[test]
    fn test_concat_and_missing() {
        let doc = json!({"cliente": {"nombre": "Ana", "apellido": "Pérez"}});
        let full = op(
            Operator::Concat,
            vec![
                Expr::field("cliente.nombre"),
                Expr::literal(json!(" ")),
                Expr::field("cliente.apellido"),
            ],
        );
        assert_eq!(full.eval(&doc).unwrap().into_value(), json!("Ana Pérez"));

        let missing = op(Operator::Concat, vec![Expr::field("asesor.nombre")]);
        assert_eq!(missing.eval(&doc).unwrap().into_value(), json!(null));
    }

    #[test]
    fn test_concat_rejects_numbers() {
        let doc = json!({"n": 5});
        let err = op(Operator::Concat, vec![Expr::field("n")]).eval(&doc).unwrap_err();
        assert!(err.contains("$concat"));
    }

    #[test]
    fn test_switch_day_names() {
        let names = ["Domingo", "Lunes", "Martes"];
        let branches = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                (
                    op(
                        Operator::Eq,
                        vec![Expr::field("_id"), Expr::literal(json!(i as i64 + 1))],
                    ),
                    Expr::literal(json!(name)),
                )
            })
            .collect();
        let switch = Expr::Switch {
            branches,
            default: None,
        };
        assert_eq!(switch.eval(&json!({"_id": 2})).unwrap().into_value(), json!("Lunes"));
        assert!(switch.eval(&json!({"_id": 9})).is_err());
    }

    #[test]
    fn test_date_parts() {
        // 2025-10-25 is a Saturday
        let doc = json!({"fecha": "2025-10-25T10:00:00.000Z"});
        let dow = op(Operator::DayOfWeek, vec![Expr::field("fecha")]);
        let month = op(Operator::Month, vec![Expr::field("fecha")]);
        let year = op(Operator::Year, vec![Expr::field("fecha")]);
        assert_eq!(dow.eval(&doc).unwrap().into_value(), json!(7));
        assert_eq!(month.eval(&doc).unwrap().into_value(), json!(10));
        assert_eq!(year.eval(&doc).unwrap().into_value(), json!(2025));

        let sunday = json!({"fecha": "2025-10-26"});
        assert_eq!(dow.eval(&sunday).unwrap().into_value(), json!(1));
    }

    #[test]
    fn test_round_average_ticket() {
        let doc = json!({"ticket_promedio": 183333.33333});
        let rounded = op(
            Operator::Round,
            vec![Expr::field("ticket_promedio"), Expr::literal(json!(2))],
        );
        assert_eq!(rounded.eval(&doc).unwrap().into_value(), json!(183333.33));
    }

    #[test]
    fn test_arithmetic_type_mismatch() {
        let doc = json!({"nombre": "Lente"});
        let err = op(Operator::Multiply, vec![Expr::field("nombre"), Expr::literal(json!(2))])
            .eval(&doc)
            .unwrap_err();
        assert!(err.contains("$multiply only supports numeric types, not string"));
    }

    #[test]
    fn test_object_expression_omits_missing() {
        let doc = json!({"fecha": "2025-03-02"});
        let key = Expr::Object(vec![
            ("mes".into(), op(Operator::Month, vec![Expr::field("fecha")])),
            ("otro".into(), Expr::field("nada")),
        ]);
        assert_eq!(key.eval(&doc).unwrap().into_value(), json!({"mes": 3}));
    }
}
