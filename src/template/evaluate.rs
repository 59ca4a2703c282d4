use std::fmt::Write;

use chrono::format::{Item, StrftimeItems};
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::template::{BinaryOperator, Expression, Node, PayloadTemplate, UnaryOperator};

/// Errors that can occur while rendering a topic or payload template
#[derive(Debug, Clone, PartialEq)]
pub enum RenderError {
    /// Variable path not found in the bindings
    VariableNotFound {
        /// The variable path that was not found
        path: String,
    },
    /// Type mismatch during operation
    TypeMismatch {
        /// Description of the type mismatch
        message: String,
    },
    /// Division by zero
    DivisionByZero,
    /// Invalid operation
    InvalidOperation {
        /// Description of the invalid operation
        message: String,
    },
    /// Regex compilation error
    RegexError {
        /// The regex pattern that failed to compile
        pattern: String,
        /// The regex error message
        error: String,
    },
    /// A topic placeholder with no value in the bindings
    MissingPlaceholder {
        /// The placeholder name
        name: String,
    },
    /// The rendered payload is not valid JSON
    InvalidJson {
        /// The JSON parser's message
        message: String,
    },
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::VariableNotFound { path } => {
                write!(f, "Variable not found: {}", path)
            }
            RenderError::TypeMismatch { message } => {
                write!(f, "Type mismatch: {}", message)
            }
            RenderError::DivisionByZero => {
                write!(f, "Division by zero")
            }
            RenderError::InvalidOperation { message } => {
                write!(f, "Invalid operation: {}", message)
            }
            RenderError::RegexError { pattern, error } => {
                write!(f, "Regex error for pattern {pattern:?}: {error}")
            }
            RenderError::MissingPlaceholder { name } => {
                write!(f, "Topic placeholder {{{}}} has no value", name)
            }
            RenderError::InvalidJson { message } => {
                write!(f, "Rendered payload is not valid JSON: {}", message)
            }
        }
    }
}

impl std::error::Error for RenderError {}

impl PayloadTemplate {
    /// Render the template against `bindings`, the only names it can see.
    pub fn render(&self, bindings: &Map<String, Value>) -> Result<String, RenderError> {
        let mut scope = Scope {
            bindings,
            locals: Vec::new(),
        };
        let mut out = String::with_capacity(self.source().len());
        render_nodes(self.nodes(), &mut scope, &mut out)?;
        Ok(out)
    }

    /// Render the template and parse the result as JSON.
    ///
    /// Returns the rendered text alongside the parsed value.
    pub fn render_json(
        &self,
        bindings: &Map<String, Value>,
    ) -> Result<(String, Value), RenderError> {
        let text = self.render(bindings)?;
        let value = serde_json::from_str(&text).map_err(|e| RenderError::InvalidJson {
            message: e.to_string(),
        })?;
        Ok((text, value))
    }
}

/// How a missing variable evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Missing {
    Error,
    Null,
}

struct Scope<'a> {
    bindings: &'a Map<String, Value>,
    locals: Vec<(String, Value)>,
}

impl Scope<'_> {
    fn lookup(&self, path: &[String]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self
            .locals
            .iter()
            .rev()
            .find(|(name, _)| name == first)
            .map(|(_, value)| value)
            .or_else(|| self.bindings.get(first))?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    fn resolve(&self, path: &[String], missing: Missing) -> Result<Value, RenderError> {
        match (self.lookup(path), missing) {
            (Some(value), _) => Ok(value.clone()),
            (None, Missing::Null) => Ok(Value::Null),
            (None, Missing::Error) => Err(RenderError::VariableNotFound {
                path: path.join("."),
            }),
        }
    }
}

fn render_nodes(
    nodes: &[Node],
    scope: &mut Scope<'_>,
    out: &mut String,
) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output(Expression::FunctionCall {
                name, arguments, ..
            }) if name == "json" => {
                let value = match arguments.first() {
                    Some(argument) => evaluate_expression(argument, scope, Missing::Error)?,
                    None => Value::Null,
                };
                out.push_str(&value.to_string());
            }
            Node::Output(expr) => {
                let value = evaluate_expression(expr, scope, Missing::Error)?;
                write_value(out, &value);
            }
            Node::If {
                branches,
                otherwise,
            } => {
                let mut chosen = otherwise;
                for (condition, body) in branches {
                    if is_truthy(&evaluate_expression(condition, scope, Missing::Null)?) {
                        chosen = body;
                        break;
                    }
                }
                render_nodes(chosen, scope, out)?;
            }
            Node::For {
                binding,
                iterable,
                body,
            } => {
                let items = match evaluate_expression(iterable, scope, Missing::Null)? {
                    Value::Null => Vec::new(),
                    Value::Array(items) => items,
                    Value::Object(map) => {
                        map.into_iter().map(|(key, _)| Value::String(key)).collect()
                    }
                    other => {
                        return Err(RenderError::TypeMismatch {
                            message: format!("Cannot iterate over {}", type_name(&other)),
                        });
                    }
                };
                let count = items.len();
                for (index, item) in items.into_iter().enumerate() {
                    let info = json!({
                        "index": index + 1,
                        "index0": index,
                        "first": index == 0,
                        "last": index + 1 == count,
                    });
                    scope.locals.push(("loop".to_string(), info));
                    scope.locals.push((binding.clone(), item));
                    let result = render_nodes(body, scope, out);
                    scope.locals.truncate(scope.locals.len() - 2);
                    result?;
                }
            }
        }
    }
    Ok(())
}

/// Strings are written JSON-escaped without their quotes; everything else as JSON.
fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::String(_) => {
            let quoted = value.to_string();
            out.push_str(&quoted[1..quoted.len() - 1]);
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Evaluate an expression against the scope
fn evaluate_expression(
    expr: &Expression,
    scope: &Scope<'_>,
    missing: Missing,
) -> Result<Value, RenderError> {
    match expr {
        Expression::Variable { path, .. } => scope.resolve(path, missing),
        Expression::StringLiteral { value, .. } => Ok(Value::String(value.clone())),
        Expression::IntegerLiteral { value, .. } => Ok(Value::from(*value)),
        Expression::FloatLiteral { value, .. } => float_value(*value, "Float literal"),
        Expression::BooleanLiteral { value, .. } => Ok(Value::Bool(*value)),
        Expression::NullLiteral { .. } => Ok(Value::Null),
        Expression::Defined { path, negated, .. } => {
            Ok(Value::Bool(scope.lookup(path).is_some() != *negated))
        }
        Expression::BinaryOperation {
            left,
            operator: BinaryOperator::LogicalAnd,
            right,
            ..
        } => {
            let left_val = evaluate_expression(left, scope, missing)?;
            if is_truthy(&left_val) {
                evaluate_expression(right, scope, missing)
            } else {
                Ok(left_val)
            }
        }
        Expression::BinaryOperation {
            left,
            operator: BinaryOperator::LogicalOr,
            right,
            ..
        } => {
            let left_val = evaluate_expression(left, scope, missing)?;
            if is_truthy(&left_val) {
                Ok(left_val)
            } else {
                evaluate_expression(right, scope, missing)
            }
        }
        Expression::BinaryOperation {
            left,
            operator,
            right,
            ..
        } => {
            let left_val = evaluate_expression(left, scope, missing)?;
            let right_val = evaluate_expression(right, scope, missing)?;
            evaluate_binary_operation(&left_val, operator, &right_val)
        }
        Expression::UnaryOperation {
            operator, operand, ..
        } => {
            let operand_val = evaluate_expression(operand, scope, missing)?;
            match operator {
                UnaryOperator::Negate => negate_value(&operand_val),
                UnaryOperator::LogicalNot => Ok(Value::Bool(!is_truthy(&operand_val))),
            }
        }
        Expression::FunctionCall {
            name, arguments, ..
        } => call_function(name, arguments, scope, missing),
    }
}

fn call_function(
    name: &str,
    arguments: &[Expression],
    scope: &Scope<'_>,
    missing: Missing,
) -> Result<Value, RenderError> {
    let argument = |index: usize, missing: Missing| -> Result<Value, RenderError> {
        match arguments.get(index) {
            Some(expr) => evaluate_expression(expr, scope, missing),
            None => Ok(Value::Null),
        }
    };
    match name {
        "now" => match argument(0, missing)? {
            Value::Null => Ok(Value::String(
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            Value::String(format) => format_now(&format),
            other => Err(RenderError::TypeMismatch {
                message: format!("now() format must be a string, found {}", type_name(&other)),
            }),
        },
        "json" => Ok(Value::String(argument(0, missing)?.to_string())),
        "lower" => match argument(0, missing)? {
            Value::String(s) => Ok(Value::String(s.to_lowercase())),
            other => Err(RenderError::TypeMismatch {
                message: format!("lower() expects a string, found {}", type_name(&other)),
            }),
        },
        "upper" => match argument(0, missing)? {
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            other => Err(RenderError::TypeMismatch {
                message: format!("upper() expects a string, found {}", type_name(&other)),
            }),
        },
        "length" => match argument(0, missing)? {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            other => Err(RenderError::TypeMismatch {
                message: format!("length() is undefined for {}", type_name(&other)),
            }),
        },
        "default" => match argument(0, Missing::Null)? {
            Value::Null => argument(1, missing),
            value => Ok(value),
        },
        _ => Err(RenderError::InvalidOperation {
            message: format!("Unknown function: {}", name),
        }),
    }
}

fn format_now(format: &str) -> Result<Value, RenderError> {
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(RenderError::InvalidOperation {
            message: format!("Invalid time format: {:?}", format),
        });
    }
    let mut out = String::new();
    write!(out, "{}", Utc::now().format_with_items(items.into_iter())).map_err(|_| {
        RenderError::InvalidOperation {
            message: format!("Invalid time format: {:?}", format),
        }
    })?;
    Ok(Value::String(out))
}

/// Evaluate a binary operation between two JSON values
fn evaluate_binary_operation(
    left: &Value,
    operator: &BinaryOperator,
    right: &Value,
) -> Result<Value, RenderError> {
    match operator {
        // Arithmetic operators
        BinaryOperator::Add => add_values(left, right),
        BinaryOperator::Subtract
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Modulo
        | BinaryOperator::Power => arithmetic(left, operator, right),

        // Comparison operators
        BinaryOperator::Equal => Ok(Value::Bool(values_equal(left, right))),
        BinaryOperator::NotEqual => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOperator::LessThan => compare_values(left, right, |cmp| cmp.is_lt()),
        BinaryOperator::LessThanOrEqual => compare_values(left, right, |cmp| cmp.is_le()),
        BinaryOperator::GreaterThan => compare_values(left, right, |cmp| cmp.is_gt()),
        BinaryOperator::GreaterThanOrEqual => compare_values(left, right, |cmp| cmp.is_ge()),

        // Short-circuited in evaluate_expression
        BinaryOperator::LogicalAnd => Ok(if is_truthy(left) {
            right.clone()
        } else {
            left.clone()
        }),
        BinaryOperator::LogicalOr => Ok(if is_truthy(left) {
            left.clone()
        } else {
            right.clone()
        }),

        BinaryOperator::RegexMatch => regex_match_values(left, right),
    }
}

/// Check if a JSON value is truthy
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(obj) => !obj.is_empty(),
    }
}

/// Numbers compare by value so that `1 == 1.0`.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

fn compare_values<F>(left: &Value, right: &Value, compare: F) -> Result<Value, RenderError>
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    let ordering = match (left, right) {
        (Value::String(l), Value::String(r)) => l.cmp(r),
        _ => {
            let l = extract_number(left)?;
            let r = extract_number(right)?;
            l.partial_cmp(&r).ok_or_else(|| RenderError::InvalidOperation {
                message: format!("Cannot compare {} and {}", l, r),
            })?
        }
    };
    Ok(Value::Bool(compare(ordering)))
}

/// Extract a numeric value from a JSON value
fn extract_number(value: &Value) -> Result<f64, RenderError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| RenderError::TypeMismatch {
            message: "Invalid number".to_string(),
        }),
        _ => Err(RenderError::TypeMismatch {
            message: format!("Expected number, found {}", type_name(value)),
        }),
    }
}

fn float_value(value: f64, op_name: &str) -> Result<Value, RenderError> {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| RenderError::InvalidOperation {
            message: format!("{} result is not a finite number: {}", op_name, value),
        })
}

/// Add two JSON values; strings concatenate.
fn add_values(left: &Value, right: &Value) -> Result<Value, RenderError> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => Ok(Value::String(format!("{}{}", l, r))),
        (Value::Number(_), Value::Number(_)) => arithmetic(left, &BinaryOperator::Add, right),
        _ => Err(RenderError::TypeMismatch {
            message: format!("Cannot add {} and {}", type_name(left), type_name(right)),
        }),
    }
}

/// Integer operands stay integers except under division.
fn arithmetic(
    left: &Value,
    operator: &BinaryOperator,
    right: &Value,
) -> Result<Value, RenderError> {
    if let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) {
        let result = match operator {
            BinaryOperator::Add => Some(l.checked_add(r)),
            BinaryOperator::Subtract => Some(l.checked_sub(r)),
            BinaryOperator::Multiply => Some(l.checked_mul(r)),
            BinaryOperator::Modulo if r == 0 => return Err(RenderError::DivisionByZero),
            BinaryOperator::Modulo => Some(l.checked_rem(r)),
            BinaryOperator::Power if r >= 0 => {
                Some(u32::try_from(r).ok().and_then(|exp| l.checked_pow(exp)))
            }
            _ => None,
        };
        if let Some(result) = result {
            return result
                .map(Value::from)
                .ok_or_else(|| RenderError::InvalidOperation {
                    message: format!("Integer overflow in {} {} {}", l, operator, r),
                });
        }
    }

    let l = extract_number(left)?;
    let r = extract_number(right)?;
    let (result, op_name) = match operator {
        BinaryOperator::Add => (l + r, "Addition"),
        BinaryOperator::Subtract => (l - r, "Subtraction"),
        BinaryOperator::Multiply => (l * r, "Multiplication"),
        BinaryOperator::Divide | BinaryOperator::Modulo if r == 0.0 => {
            return Err(RenderError::DivisionByZero);
        }
        BinaryOperator::Divide => (l / r, "Division"),
        BinaryOperator::Modulo => (l % r, "Modulo"),
        BinaryOperator::Power => (l.powf(r), "Power"),
        other => {
            return Err(RenderError::InvalidOperation {
                message: format!("{} is not arithmetic", other),
            });
        }
    };
    float_value(result, op_name)
}

/// Negate a numeric JSON value
fn negate_value(value: &Value) -> Result<Value, RenderError> {
    if let Some(i) = value.as_i64() {
        return i
            .checked_neg()
            .map(Value::from)
            .ok_or_else(|| RenderError::InvalidOperation {
                message: format!("Integer overflow negating {}", i),
            });
    }
    float_value(-extract_number(value)?, "Negation")
}

/// Get the type name of a JSON value for error messages
fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Match a string against a regex pattern
fn regex_match_values(left: &Value, right: &Value) -> Result<Value, RenderError> {
    let (Value::String(text), Value::String(pattern)) = (left, right) else {
        return Err(RenderError::TypeMismatch {
            message: format!(
                "Regex match requires strings, found {} and {}",
                type_name(left),
                type_name(right)
            ),
        });
    };
    let regex = Regex::new(pattern).map_err(|e| RenderError::RegexError {
        pattern: pattern.clone(),
        error: e.to_string(),
    })?;
    Ok(Value::Bool(regex.is_match(text)))
}
