use serde_json::{Map, Value};

use crate::template::{Position, RenderError, TemplateSyntaxError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Placeholder(String),
}

/// A topic template: literal text with `{name}` placeholders.
///
/// `{{` and `}}` write a literal brace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    source: String,
    pieces: Vec<Piece>,
}

impl TopicTemplate {
    /// Parse a topic template.
    pub fn parse(source: &str) -> Result<Self, TemplateSyntaxError> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().enumerate().peekable();

        while let Some((index, ch)) = chars.next() {
            match ch {
                '{' if chars.peek().map(|(_, c)| *c) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|(_, c)| *c) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (at, c) in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            c if c.is_ascii_alphanumeric() || c == '_' => name.push(c),
                            c => {
                                return Err(TemplateSyntaxError::InvalidCharacter {
                                    character: c,
                                    position: Position::new(1, at + 1),
                                });
                            }
                        }
                    }
                    if !closed {
                        return Err(TemplateSyntaxError::UnclosedTag {
                            delimiter: "}",
                            position: Position::new(1, index + 1),
                        });
                    }
                    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
                        return Err(TemplateSyntaxError::UnexpectedToken {
                            found: format!("{{{}}}", name),
                            expected: "placeholder name".to_string(),
                            position: Position::new(1, index + 1),
                        });
                    }
                    if !literal.is_empty() {
                        pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    }
                    pieces.push(Piece::Placeholder(name));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            pieces,
        })
    }

    /// The template text this was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.pieces.iter().filter_map(|piece| match piece {
            Piece::Placeholder(name) => Some(name.as_str()),
            Piece::Literal(_) => None,
        })
    }

    /// Substitute every placeholder from `bindings`.
    ///
    /// Strings are written as-is, booleans as `true`/`false`, other values as JSON.
    pub fn render(&self, bindings: &Map<String, Value>) -> Result<String, RenderError> {
        let mut out = String::with_capacity(self.source.len());
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Placeholder(name) => match bindings.get(name) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(value) => out.push_str(&value.to_string()),
                    None => {
                        return Err(RenderError::MissingPlaceholder { name: name.clone() });
                    }
                },
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn substitutes_typed_values() {
        let template = TopicTemplate::parse("dev/{a}/{b}").unwrap();
        let out = template.render(&bindings(json!({"a": 1, "b": "x"}))).unwrap();
        assert_eq!(out, "dev/1/x");
    }

    #[test]
    fn booleans_and_floats() {
        let template = TopicTemplate::parse("t/{on}/{level}").unwrap();
        let out = template
            .render(&bindings(json!({"on": false, "level": 2.5})))
            .unwrap();
        assert_eq!(out, "t/false/2.5");
    }

    #[test]
    fn placeholders_in_order() {
        let template = TopicTemplate::parse("home/{room}/{device}/set").unwrap();
        assert_eq!(
            template.placeholders().collect::<Vec<_>>(),
            vec!["room", "device"]
        );
    }

    #[test]
    fn missing_value_is_an_error() {
        let template = TopicTemplate::parse("dev/{a}/{b}").unwrap();
        let result = template.render(&bindings(json!({"a": 1})));
        assert_eq!(
            result,
            Err(RenderError::MissingPlaceholder {
                name: "b".to_string()
            })
        );
    }

    #[test]
    fn doubled_braces_are_literal() {
        let template = TopicTemplate::parse("a/{{x}}/{y}").unwrap();
        assert_eq!(template.placeholders().collect::<Vec<_>>(), vec!["y"]);
        let out = template.render(&bindings(json!({"y": "z"}))).unwrap();
        assert_eq!(out, "a/{x}/z");
    }

    #[test]
    fn no_placeholders() {
        let template = TopicTemplate::parse("sensors/all").unwrap();
        assert_eq!(template.render(&Map::new()).unwrap(), "sensors/all");
    }

    #[test]
    fn malformed_placeholders() {
        assert!(matches!(
            TopicTemplate::parse("dev/{a"),
            Err(TemplateSyntaxError::UnclosedTag { .. })
        ));
        assert!(matches!(
            TopicTemplate::parse("dev/{}"),
            Err(TemplateSyntaxError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            TopicTemplate::parse("dev/{a-b}"),
            Err(TemplateSyntaxError::InvalidCharacter { character: '-', .. })
        ));
    }
}
