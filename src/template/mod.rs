//! # Payload and Topic Templates
//!
//! Routes carry two templates.  The topic template is plain `{name}` substitution
//! (see [`TopicTemplate`]).  The payload template is a small template language
//! whose output must be JSON text:
//!
//! ```text
//! {"device": "{{ device }}", "state": {{ state }}{% if brightness is defined %}, "brightness": {{ brightness }}{% endif %}}
//! ```
//!
//! ## Syntax
//!
//! - `{{ expr }}` writes the value of an expression.  Strings are written JSON-escaped
//!   without quotes, booleans as `true`/`false`, everything else as JSON.
//! - `{% if expr %}`, `{% elif expr %}`, `{% else %}`, `{% endif %}` select a branch.
//! - `{% for item in expr %}` ... `{% endfor %}` repeats its body; `loop.index`,
//!   `loop.index0`, `loop.first` and `loop.last` are bound inside.
//! - `{# ... #}` is a comment.
//!
//! Expressions support:
//! - **Variables**: dot-separated paths like `reading.value`
//! - **Literals**: strings ("hello"), integers (42), floats (3.14), `true`, `false`, `null`
//! - **Arithmetic**: `+`, `-`, `*`, `/`, `%`, `^`
//! - **Comparison**: `==`, `!=`, `<`, `<=`, `>`, `>=`, and `~=` for regex match
//! - **Logical**: `&&`/`and`, `||`/`or`, `!`/`not`
//! - **Tests**: `name is defined`, `name is not defined`
//! - **Functions**: `now()`, `json(x)`, `lower(s)`, `upper(s)`, `length(x)`, `default(x, y)`
//!
//! The only names an expression can see are the bindings passed to
//! [`PayloadTemplate::render`] and loop variables.
//!
//! ```rust
//! use serde_json::{Map, json};
//! use webhook_bridge::PayloadTemplate;
//!
//! let template = PayloadTemplate::parse(r#"{"on": {{ state }}, "tags": [{% for t in tags %}"{{ t }}"{% if !loop.last %},{% endif %}{% endfor %}]}"#).unwrap();
//! let mut bindings = Map::new();
//! bindings.insert("state".into(), json!(false));
//! bindings.insert("tags".into(), json!(["a", "b"]));
//! assert_eq!(template.render(&bindings).unwrap(), r#"{"on": false, "tags": ["a","b"]}"#);
//! ```

use std::fmt;

mod evaluate;
mod topic;

pub use evaluate::RenderError;
pub use topic::TopicTemplate;

/// Position information for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub column: usize,
}

impl Position {
    /// Create a new position
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Starting position
    pub fn start() -> Self {
        Self::new(1, 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A parsed expression that can be evaluated
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Variable reference with dot-separated path (e.g., "reading.value")
    Variable {
        /// The variable path segments
        path: Vec<String>,
        /// Source position for error reporting
        position: Position,
    },
    /// String literal value
    StringLiteral {
        /// The string value
        value: String,
        /// Source position for error reporting
        position: Position,
    },
    /// Integer literal value
    IntegerLiteral {
        /// The integer value
        value: i64,
        /// Source position for error reporting
        position: Position,
    },
    /// Float literal value
    FloatLiteral {
        /// The float value
        value: f64,
        /// Source position for error reporting
        position: Position,
    },
    /// Boolean literal value
    BooleanLiteral {
        /// The boolean value
        value: bool,
        /// Source position for error reporting
        position: Position,
    },
    /// The `null` literal
    NullLiteral {
        /// Source position for error reporting
        position: Position,
    },
    /// Binary operation (e.g., a + b, x == y)
    BinaryOperation {
        /// Left operand
        left: Box<Expression>,
        /// The operator
        operator: BinaryOperator,
        /// Right operand
        right: Box<Expression>,
        /// Source position for error reporting
        position: Position,
    },
    /// Unary operation (e.g., -x, !condition)
    UnaryOperation {
        /// The operator
        operator: UnaryOperator,
        /// The operand
        operand: Box<Expression>,
        /// Source position for error reporting
        position: Position,
    },
    /// Call of a built-in function (e.g., now())
    FunctionCall {
        /// The function name
        name: String,
        /// Argument expressions
        arguments: Vec<Expression>,
        /// Source position for error reporting
        position: Position,
    },
    /// `path is defined` / `path is not defined`
    Defined {
        /// The variable path being tested
        path: Vec<String>,
        /// True for `is not defined`
        negated: bool,
        /// Source position for error reporting
        position: Position,
    },
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Variable { path, .. } => write!(f, "{}", path.join(".")),
            Expression::StringLiteral { value, .. } => write!(f, "\"{}\"", value),
            Expression::IntegerLiteral { value, .. } => write!(f, "{}", value),
            Expression::FloatLiteral { value, .. } => write!(f, "{}", value),
            Expression::BooleanLiteral { value, .. } => write!(f, "{}", value),
            Expression::NullLiteral { .. } => write!(f, "null"),
            Expression::BinaryOperation {
                left,
                operator,
                right,
                ..
            } => write!(f, "({} {} {})", left, operator, right),
            Expression::UnaryOperation {
                operator, operand, ..
            } => write!(f, "{}({})", operator, operand),
            Expression::FunctionCall {
                name, arguments, ..
            } => {
                write!(f, "{}(", name)?;
                for (i, argument) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", argument)?;
                }
                write!(f, ")")
            }
            Expression::Defined { path, negated, .. } => {
                if *negated {
                    write!(f, "{} is not defined", path.join("."))
                } else {
                    write!(f, "{} is defined", path.join("."))
                }
            }
        }
    }
}

/// Binary operators with precedence information
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryOperator {
    // Arithmetic operators
    /// Addition
    Add,
    /// Subtraction
    Subtract,
    /// Multiplication
    Multiply,
    /// Division
    Divide,
    /// Modulo
    Modulo,
    /// Exponentiation
    Power,

    // Comparison operators
    /// Equal
    Equal,
    /// Not equal
    NotEqual,
    /// Less than
    LessThan,
    /// Less than or equal
    LessThanOrEqual,
    /// Greater than
    GreaterThan,
    /// Greater than or equal
    GreaterThanOrEqual,

    // Logical operators
    /// Logical AND
    LogicalAnd,
    /// Logical OR
    LogicalOr,

    // Regex operators
    /// Regex match
    RegexMatch,
}

impl BinaryOperator {
    /// Get operator precedence (higher number = higher precedence)
    pub const fn precedence(&self) -> u8 {
        match self {
            BinaryOperator::LogicalOr => 1,
            BinaryOperator::LogicalAnd => 2,
            BinaryOperator::Equal | BinaryOperator::NotEqual | BinaryOperator::RegexMatch => 3,
            BinaryOperator::LessThan
            | BinaryOperator::LessThanOrEqual
            | BinaryOperator::GreaterThan
            | BinaryOperator::GreaterThanOrEqual => 4,
            BinaryOperator::Add | BinaryOperator::Subtract => 5,
            BinaryOperator::Multiply | BinaryOperator::Divide | BinaryOperator::Modulo => 6,
            BinaryOperator::Power => 7,
        }
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Power => "^",
            BinaryOperator::Equal => "==",
            BinaryOperator::NotEqual => "!=",
            BinaryOperator::LessThan => "<",
            BinaryOperator::LessThanOrEqual => "<=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::GreaterThanOrEqual => ">=",
            BinaryOperator::LogicalAnd => "&&",
            BinaryOperator::LogicalOr => "||",
            BinaryOperator::RegexMatch => "~=",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnaryOperator {
    /// Arithmetic negation
    Negate,
    /// Logical NOT
    LogicalNot,
}

impl fmt::Display for UnaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnaryOperator::Negate => "-",
            UnaryOperator::LogicalNot => "!",
        };
        write!(f, "{}", s)
    }
}

/// Built-in functions with their accepted argument counts.
const FUNCTIONS: &[(&str, usize, usize)] = &[
    ("now", 0, 1),
    ("json", 1, 1),
    ("lower", 1, 1),
    ("upper", 1, 1),
    ("length", 1, 1),
    ("default", 2, 2),
];

/// One node of a parsed payload template.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Literal text copied to the output.
    Text(String),
    /// `{{ expr }}`
    Output(Expression),
    /// `{% if %}` chain.
    If {
        /// `(condition, body)` pairs for `if` and each `elif`, in order.
        branches: Vec<(Expression, Vec<Node>)>,
        /// The `else` body, empty when absent.
        otherwise: Vec<Node>,
    },
    /// `{% for binding in iterable %}`
    For {
        /// Name bound to each item.
        binding: String,
        /// The collection iterated.
        iterable: Expression,
        /// The repeated body.
        body: Vec<Node>,
    },
}

/// Errors that can occur while parsing a template
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateSyntaxError {
    /// Unexpected token during parsing
    UnexpectedToken {
        /// What was found
        found: String,
        /// What was expected
        expected: String,
        /// Where the error occurred
        position: Position,
    },
    /// Invalid numeric literal
    InvalidNumber {
        /// The invalid text
        text: String,
        /// Where the error occurred
        position: Position,
    },
    /// Unterminated string literal
    UnterminatedString {
        /// Where the string started
        position: Position,
    },
    /// Invalid character in input
    InvalidCharacter {
        /// The invalid character
        character: char,
        /// Where the error occurred
        position: Position,
    },
    /// Empty `{{ }}` or `{% %}`
    EmptyExpression {
        /// Where the error was detected
        position: Position,
    },
    /// A `{{`, `{%` or `{#` without its closing delimiter
    UnclosedTag {
        /// The closing delimiter that is missing
        delimiter: &'static str,
        /// Where the tag opened
        position: Position,
    },
    /// An `if` or `for` without its end tag
    UnclosedBlock {
        /// The block keyword
        keyword: &'static str,
        /// Where the block opened
        position: Position,
    },
    /// A block tag where it cannot appear (e.g. `endif` with no open `if`)
    UnexpectedBlockTag {
        /// The tag keyword that was found
        keyword: &'static str,
        /// Where it was found
        position: Position,
    },
    /// Call of a function that does not exist
    UnknownFunction {
        /// The function name
        name: String,
        /// Where the call is
        position: Position,
    },
    /// Call of a function with the wrong number of arguments
    WrongArity {
        /// The function name
        name: String,
        /// How many arguments were given
        given: usize,
        /// Where the call is
        position: Position,
    },
}

impl fmt::Display for TemplateSyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateSyntaxError::UnexpectedToken {
                found,
                expected,
                position,
            } => write!(
                f,
                "Unexpected token '{}' at {}, expected {}",
                found, position, expected
            ),
            TemplateSyntaxError::InvalidNumber { text, position } => {
                write!(f, "Invalid number '{}' at {}", text, position)
            }
            TemplateSyntaxError::UnterminatedString { position } => {
                write!(f, "Unterminated string literal at {}", position)
            }
            TemplateSyntaxError::InvalidCharacter {
                character,
                position,
            } => write!(f, "Invalid character '{}' at {}", character, position),
            TemplateSyntaxError::EmptyExpression { position } => {
                write!(f, "Empty expression at {}", position)
            }
            TemplateSyntaxError::UnclosedTag {
                delimiter,
                position,
            } => write!(f, "Tag opened at {} is missing '{}'", position, delimiter),
            TemplateSyntaxError::UnclosedBlock { keyword, position } => {
                write!(f, "'{}' block opened at {} is never closed", keyword, position)
            }
            TemplateSyntaxError::UnexpectedBlockTag { keyword, position } => {
                write!(f, "Unexpected '{}' at {}", keyword, position)
            }
            TemplateSyntaxError::UnknownFunction { name, position } => {
                write!(f, "Unknown function '{}' at {}", name, position)
            }
            TemplateSyntaxError::WrongArity {
                name,
                given,
                position,
            } => write!(
                f,
                "Function '{}' called with {} argument(s) at {}",
                name, given, position
            ),
        }
    }
}

impl std::error::Error for TemplateSyntaxError {}

/// A parsed payload template, ready to render.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadTemplate {
    source: String,
    nodes: Vec<Node>,
}

impl PayloadTemplate {
    /// Parse a payload template
    pub fn parse(source: &str) -> Result<Self, TemplateSyntaxError> {
        let segments = scan(source)?;
        let mut parser = BlockParser {
            segments: segments.into_iter(),
        };
        let (nodes, terminator) = parser.parse_block()?;
        if let Some((statement, position)) = terminator {
            return Err(TemplateSyntaxError::UnexpectedBlockTag {
                keyword: statement.keyword(),
                position,
            });
        }
        Ok(Self {
            source: source.to_string(),
            nodes,
        })
    }

    /// The template text this was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parsed nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// A raw piece of template source, before expression parsing.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Output { source: String, position: Position },
    Statement { source: String, position: Position },
}

/// Split template source into text, output tags and statement tags, dropping comments.
fn scan(source: &str) -> Result<Vec<Segment>, TemplateSyntaxError> {
    let mut segments = Vec::new();
    let mut cursor = 0;

    while let Some((start, opener)) = next_tag(source, cursor) {
        if start > cursor {
            segments.push(Segment::Text(source[cursor..start].to_string()));
        }
        let closer = match opener {
            '{' => "}}",
            '%' => "%}",
            _ => "#}",
        };
        let inner_start = start + 2;
        let inner_end = source[inner_start..]
            .find(closer)
            .map(|offset| inner_start + offset)
            .ok_or_else(|| TemplateSyntaxError::UnclosedTag {
                delimiter: closer,
                position: position_at(source, start),
            })?;
        let inner = source[inner_start..inner_end].to_string();
        let position = position_at(source, inner_start);
        match opener {
            '{' => segments.push(Segment::Output {
                source: inner,
                position,
            }),
            '%' => segments.push(Segment::Statement {
                source: inner,
                position,
            }),
            _ => {}
        }
        cursor = inner_end + closer.len();
    }

    if cursor < source.len() {
        segments.push(Segment::Text(source[cursor..].to_string()));
    }
    Ok(segments)
}

/// Find the next `{{`, `{%` or `{#` at or after `from`.
fn next_tag(source: &str, from: usize) -> Option<(usize, char)> {
    source[from..].match_indices('{').find_map(|(offset, _)| {
        let start = from + offset;
        match source[start + 1..].chars().next() {
            Some(c @ ('{' | '%' | '#')) => Some((start, c)),
            _ => None,
        }
    })
}

fn position_at(source: &str, offset: usize) -> Position {
    let mut position = Position::start();
    for ch in source[..offset].chars() {
        if ch == '\n' {
            position.line += 1;
            position.column = 1;
        } else {
            position.column += 1;
        }
    }
    position
}

/// A block tag after expression parsing.
#[derive(Debug, Clone, PartialEq)]
enum Statement {
    If(Expression),
    Elif(Expression),
    Else,
    EndIf,
    For {
        binding: String,
        iterable: Expression,
    },
    EndFor,
}

impl Statement {
    fn keyword(&self) -> &'static str {
        match self {
            Statement::If(_) => "if",
            Statement::Elif(_) => "elif",
            Statement::Else => "else",
            Statement::EndIf => "endif",
            Statement::For { .. } => "for",
            Statement::EndFor => "endfor",
        }
    }
}

/// Assembles segments into nested nodes.
struct BlockParser {
    segments: std::vec::IntoIter<Segment>,
}

type BlockEnd = Option<(Statement, Position)>;

impl BlockParser {
    /// Parse nodes until end of input or a tag that closes or continues an enclosing block.
    fn parse_block(&mut self) -> Result<(Vec<Node>, BlockEnd), TemplateSyntaxError> {
        let mut nodes = Vec::new();
        while let Some(segment) = self.segments.next() {
            match segment {
                Segment::Text(text) => nodes.push(Node::Text(text)),
                Segment::Output { source, position } => {
                    let mut lexer = Lexer::starting_at(&source, position);
                    let mut parser = Parser::new(&mut lexer)?;
                    nodes.push(Node::Output(parser.parse_output()?));
                }
                Segment::Statement { source, position } => {
                    let mut lexer = Lexer::starting_at(&source, position);
                    let mut parser = Parser::new(&mut lexer)?;
                    match parser.parse_statement()? {
                        Statement::If(condition) => {
                            nodes.push(self.parse_if(condition, position)?);
                        }
                        Statement::For { binding, iterable } => {
                            nodes.push(self.parse_for(binding, iterable, position)?);
                        }
                        terminator => return Ok((nodes, Some((terminator, position)))),
                    }
                }
            }
        }
        Ok((nodes, None))
    }

    fn parse_if(
        &mut self,
        condition: Expression,
        opened: Position,
    ) -> Result<Node, TemplateSyntaxError> {
        let mut branches = Vec::new();
        let mut condition = condition;
        loop {
            let (body, end) = self.parse_block()?;
            branches.push((condition, body));
            match end {
                Some((Statement::Elif(next), _)) => condition = next,
                Some((Statement::Else, _)) => {
                    let (otherwise, end) = self.parse_block()?;
                    return match end {
                        Some((Statement::EndIf, _)) => Ok(Node::If {
                            branches,
                            otherwise,
                        }),
                        Some((other, position)) => Err(TemplateSyntaxError::UnexpectedBlockTag {
                            keyword: other.keyword(),
                            position,
                        }),
                        None => Err(TemplateSyntaxError::UnclosedBlock {
                            keyword: "if",
                            position: opened,
                        }),
                    };
                }
                Some((Statement::EndIf, _)) => {
                    return Ok(Node::If {
                        branches,
                        otherwise: Vec::new(),
                    });
                }
                Some((other, position)) => {
                    return Err(TemplateSyntaxError::UnexpectedBlockTag {
                        keyword: other.keyword(),
                        position,
                    });
                }
                None => {
                    return Err(TemplateSyntaxError::UnclosedBlock {
                        keyword: "if",
                        position: opened,
                    });
                }
            }
        }
    }

    fn parse_for(
        &mut self,
        binding: String,
        iterable: Expression,
        opened: Position,
    ) -> Result<Node, TemplateSyntaxError> {
        let (body, end) = self.parse_block()?;
        match end {
            Some((Statement::EndFor, _)) => Ok(Node::For {
                binding,
                iterable,
                body,
            }),
            Some((other, position)) => Err(TemplateSyntaxError::UnexpectedBlockTag {
                keyword: other.keyword(),
                position,
            }),
            None => Err(TemplateSyntaxError::UnclosedBlock {
                keyword: "for",
                position: opened,
            }),
        }
    }
}

/// Token types for the lexer
#[derive(Debug, Clone, PartialEq)]
enum TokenType {
    // Identifiers and literals
    Identifier(String),
    StringLiteral(String),
    IntegerLiteral(i64),
    FloatLiteral(f64),
    BooleanLiteral(bool),
    Null,

    // Keywords
    Is,
    In,

    // Operators
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Power,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LogicalAnd,
    LogicalOr,
    LogicalNot,
    RegexMatch,

    // Punctuation
    Dot,
    Comma,
    LeftParen,
    RightParen,

    // Special
    EndOfInput,
}

/// A token with position information
#[derive(Debug, Clone)]
struct Token {
    token_type: TokenType,
    position: Position,
}

/// Lexer for tokenizing the inside of a tag
struct Lexer {
    /// Input text
    input: Vec<char>,
    /// Current position in input
    position: usize,
    /// Current line number (1-based)
    line: usize,
    /// Current column number (1-based)
    column: usize,
}

impl Lexer {
    fn starting_at(input: &str, start: Position) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            line: start.line,
            column: start.column,
        }
    }

    fn current_position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn current_char(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn advance(&mut self) -> Option<char> {
        if let Some(ch) = self.current_char() {
            self.position += 1;
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
            Some(ch)
        } else {
            None
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn single(&mut self, token_type: TokenType, position: Position) -> Token {
        self.advance();
        Token {
            token_type,
            position,
        }
    }

    /// Consume `first`, then return `paired` if `second` follows, else `alone`.
    fn one_or_two(
        &mut self,
        second: char,
        paired: TokenType,
        alone: Option<TokenType>,
        position: Position,
    ) -> Result<Token, TemplateSyntaxError> {
        let first = self.current_char();
        self.advance();
        if self.current_char() == Some(second) {
            self.advance();
            return Ok(Token {
                token_type: paired,
                position,
            });
        }
        match alone {
            Some(token_type) => Ok(Token {
                token_type,
                position,
            }),
            None => Err(TemplateSyntaxError::InvalidCharacter {
                character: first.unwrap_or(second),
                position,
            }),
        }
    }

    fn next_token(&mut self) -> Result<Token, TemplateSyntaxError> {
        self.skip_whitespace();

        let position = self.current_position();

        match self.current_char() {
            None => Ok(Token {
                token_type: TokenType::EndOfInput,
                position,
            }),
            Some(ch) => match ch {
                '(' => Ok(self.single(TokenType::LeftParen, position)),
                ')' => Ok(self.single(TokenType::RightParen, position)),
                '.' => Ok(self.single(TokenType::Dot, position)),
                ',' => Ok(self.single(TokenType::Comma, position)),
                '+' => Ok(self.single(TokenType::Plus, position)),
                '-' => Ok(self.single(TokenType::Minus, position)),
                '*' => Ok(self.single(TokenType::Multiply, position)),
                '/' => Ok(self.single(TokenType::Divide, position)),
                '%' => Ok(self.single(TokenType::Modulo, position)),
                '^' => Ok(self.single(TokenType::Power, position)),
                '=' => self.one_or_two('=', TokenType::Equal, None, position),
                '!' => self.one_or_two(
                    '=',
                    TokenType::NotEqual,
                    Some(TokenType::LogicalNot),
                    position,
                ),
                '<' => self.one_or_two(
                    '=',
                    TokenType::LessThanOrEqual,
                    Some(TokenType::LessThan),
                    position,
                ),
                '>' => self.one_or_two(
                    '=',
                    TokenType::GreaterThanOrEqual,
                    Some(TokenType::GreaterThan),
                    position,
                ),
                '&' => self.one_or_two('&', TokenType::LogicalAnd, None, position),
                '|' => self.one_or_two('|', TokenType::LogicalOr, None, position),
                '~' => self.one_or_two('=', TokenType::RegexMatch, None, position),
                '"' | '\'' => self.read_string_literal(ch, position),
                ch if ch.is_ascii_alphabetic() || ch == '_' => {
                    Ok(self.read_identifier_or_keyword(position))
                }
                ch if ch.is_ascii_digit() => self.read_number_literal(position),
                _ => Err(TemplateSyntaxError::InvalidCharacter {
                    character: ch,
                    position,
                }),
            },
        }
    }

    fn read_string_literal(
        &mut self,
        quote: char,
        start_position: Position,
    ) -> Result<Token, TemplateSyntaxError> {
        self.advance(); // Skip opening quote
        let mut value = String::new();

        while let Some(ch) = self.current_char() {
            if ch == quote {
                self.advance(); // Skip closing quote
                return Ok(Token {
                    token_type: TokenType::StringLiteral(value),
                    position: start_position,
                });
            } else if ch == '\\' {
                self.advance();
                match self.current_char() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some(escape_ch) => value.push(escape_ch),
                    None => break,
                }
                self.advance();
            } else {
                value.push(ch);
                self.advance();
            }
        }

        Err(TemplateSyntaxError::UnterminatedString {
            position: start_position,
        })
    }

    fn read_identifier_or_keyword(&mut self, position: Position) -> Token {
        let mut value = String::new();

        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                value.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let token_type = match value.as_str() {
            "true" => TokenType::BooleanLiteral(true),
            "false" => TokenType::BooleanLiteral(false),
            "null" => TokenType::Null,
            "and" => TokenType::LogicalAnd,
            "or" => TokenType::LogicalOr,
            "not" => TokenType::LogicalNot,
            "is" => TokenType::Is,
            "in" => TokenType::In,
            _ => TokenType::Identifier(value),
        };

        Token {
            token_type,
            position,
        }
    }

    fn read_number_literal(&mut self, position: Position) -> Result<Token, TemplateSyntaxError> {
        let mut value = String::new();
        let mut has_dot = false;

        while let Some(ch) = self.current_char() {
            if ch.is_ascii_digit() {
                value.push(ch);
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                value.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let token_type = if has_dot {
            value.parse::<f64>().ok().map(TokenType::FloatLiteral)
        } else {
            value.parse::<i64>().ok().map(TokenType::IntegerLiteral)
        };
        match token_type {
            Some(token_type) if !value.ends_with('.') => Ok(Token {
                token_type,
                position,
            }),
            _ => Err(TemplateSyntaxError::InvalidNumber {
                text: value,
                position,
            }),
        }
    }
}

/// Recursive descent parser for the inside of one tag
struct Parser<'a> {
    lexer: &'a mut Lexer,
    current_token: Token,
}

impl<'a> Parser<'a> {
    fn new(lexer: &'a mut Lexer) -> Result<Self, TemplateSyntaxError> {
        let current_token = lexer.next_token()?;
        Ok(Self {
            lexer,
            current_token,
        })
    }

    fn advance(&mut self) -> Result<(), TemplateSyntaxError> {
        self.current_token = self.lexer.next_token()?;
        Ok(())
    }

    fn unexpected(&self, expected: &str) -> TemplateSyntaxError {
        TemplateSyntaxError::UnexpectedToken {
            found: format!("{:?}", self.current_token.token_type),
            expected: expected.to_string(),
            position: self.current_token.position,
        }
    }

    fn expect_end(&self) -> Result<(), TemplateSyntaxError> {
        if matches!(self.current_token.token_type, TokenType::EndOfInput) {
            Ok(())
        } else {
            Err(self.unexpected("end of tag"))
        }
    }

    /// Parse the contents of `{{ ... }}`
    fn parse_output(&mut self) -> Result<Expression, TemplateSyntaxError> {
        if matches!(self.current_token.token_type, TokenType::EndOfInput) {
            return Err(TemplateSyntaxError::EmptyExpression {
                position: self.current_token.position,
            });
        }
        let expression = self.parse_expression()?;
        self.expect_end()?;
        Ok(expression)
    }

    /// Parse the contents of `{% ... %}`
    fn parse_statement(&mut self) -> Result<Statement, TemplateSyntaxError> {
        let keyword = match &self.current_token.token_type {
            TokenType::Identifier(keyword) => keyword.clone(),
            TokenType::EndOfInput => {
                return Err(TemplateSyntaxError::EmptyExpression {
                    position: self.current_token.position,
                });
            }
            _ => return Err(self.unexpected("block keyword")),
        };
        self.advance()?;

        let statement = match keyword.as_str() {
            "if" => Statement::If(self.parse_expression()?),
            "elif" => Statement::Elif(self.parse_expression()?),
            "else" => Statement::Else,
            "endif" => Statement::EndIf,
            "endfor" => Statement::EndFor,
            "for" => {
                let binding = match &self.current_token.token_type {
                    TokenType::Identifier(name) => name.clone(),
                    _ => return Err(self.unexpected("loop variable")),
                };
                self.advance()?;
                if !matches!(self.current_token.token_type, TokenType::In) {
                    return Err(self.unexpected("'in'"));
                }
                self.advance()?;
                let iterable = self.parse_expression()?;
                Statement::For { binding, iterable }
            }
            _ => {
                return Err(TemplateSyntaxError::UnexpectedToken {
                    found: keyword,
                    expected: "if, elif, else, endif, for or endfor".to_string(),
                    position: self.current_token.position,
                });
            }
        };
        self.expect_end()?;
        Ok(statement)
    }

    fn parse_expression(&mut self) -> Result<Expression, TemplateSyntaxError> {
        self.parse_logical_or()
    }

    fn parse_binary_left_associative<F, G>(
        &mut self,
        mut next_level: F,
        token_matcher: G,
        operator_mapper: fn(&TokenType) -> BinaryOperator,
    ) -> Result<Expression, TemplateSyntaxError>
    where
        F: FnMut(&mut Self) -> Result<Expression, TemplateSyntaxError>,
        G: Fn(&TokenType) -> bool,
    {
        let mut left = next_level(self)?;

        while token_matcher(&self.current_token.token_type) {
            let position = self.current_token.position;
            let operator = operator_mapper(&self.current_token.token_type);
            self.advance()?;
            let right = next_level(self)?;
            left = Expression::BinaryOperation {
                left: Box::new(left),
                operator,
                right: Box::new(right),
                position,
            };
        }

        Ok(left)
    }

    fn parse_logical_or(&mut self) -> Result<Expression, TemplateSyntaxError> {
        self.parse_binary_left_associative(
            |parser| parser.parse_logical_and(),
            |token| matches!(token, TokenType::LogicalOr),
            |_| BinaryOperator::LogicalOr,
        )
    }

    fn parse_logical_and(&mut self) -> Result<Expression, TemplateSyntaxError> {
        self.parse_binary_left_associative(
            |parser| parser.parse_equality(),
            |token| matches!(token, TokenType::LogicalAnd),
            |_| BinaryOperator::LogicalAnd,
        )
    }

    fn parse_equality(&mut self) -> Result<Expression, TemplateSyntaxError> {
        self.parse_binary_left_associative(
            |parser| parser.parse_comparison(),
            |token| {
                matches!(
                    token,
                    TokenType::Equal | TokenType::NotEqual | TokenType::RegexMatch
                )
            },
            |token| match token {
                TokenType::Equal => BinaryOperator::Equal,
                TokenType::NotEqual => BinaryOperator::NotEqual,
                _ => BinaryOperator::RegexMatch,
            },
        )
    }

    fn parse_comparison(&mut self) -> Result<Expression, TemplateSyntaxError> {
        self.parse_binary_left_associative(
            |parser| parser.parse_addition(),
            |token| {
                matches!(
                    token,
                    TokenType::LessThan
                        | TokenType::LessThanOrEqual
                        | TokenType::GreaterThan
                        | TokenType::GreaterThanOrEqual
                )
            },
            |token| match token {
                TokenType::LessThan => BinaryOperator::LessThan,
                TokenType::LessThanOrEqual => BinaryOperator::LessThanOrEqual,
                TokenType::GreaterThan => BinaryOperator::GreaterThan,
                _ => BinaryOperator::GreaterThanOrEqual,
            },
        )
    }

    fn parse_addition(&mut self) -> Result<Expression, TemplateSyntaxError> {
        self.parse_binary_left_associative(
            |parser| parser.parse_multiplication(),
            |token| matches!(token, TokenType::Plus | TokenType::Minus),
            |token| match token {
                TokenType::Plus => BinaryOperator::Add,
                _ => BinaryOperator::Subtract,
            },
        )
    }

    fn parse_multiplication(&mut self) -> Result<Expression, TemplateSyntaxError> {
        self.parse_binary_left_associative(
            |parser| parser.parse_power(),
            |token| {
                matches!(
                    token,
                    TokenType::Multiply | TokenType::Divide | TokenType::Modulo
                )
            },
            |token| match token {
                TokenType::Multiply => BinaryOperator::Multiply,
                TokenType::Divide => BinaryOperator::Divide,
                _ => BinaryOperator::Modulo,
            },
        )
    }

    fn parse_power(&mut self) -> Result<Expression, TemplateSyntaxError> {
        let left = self.parse_unary()?;

        if matches!(self.current_token.token_type, TokenType::Power) {
            let position = self.current_token.position;
            self.advance()?;
            // Right-associative
            let right = self.parse_power()?;
            Ok(Expression::BinaryOperation {
                left: Box::new(left),
                operator: BinaryOperator::Power,
                right: Box::new(right),
                position,
            })
        } else {
            Ok(left)
        }
    }

    fn parse_unary(&mut self) -> Result<Expression, TemplateSyntaxError> {
        let operator = match self.current_token.token_type {
            TokenType::Minus => UnaryOperator::Negate,
            TokenType::LogicalNot => UnaryOperator::LogicalNot,
            _ => return self.parse_primary(),
        };
        let position = self.current_token.position;
        self.advance()?;
        let operand = self.parse_unary()?;
        Ok(Expression::UnaryOperation {
            operator,
            operand: Box::new(operand),
            position,
        })
    }

    fn parse_primary(&mut self) -> Result<Expression, TemplateSyntaxError> {
        let position = self.current_token.position;
        match &self.current_token.token_type {
            TokenType::Identifier(name) => {
                let name = name.clone();
                self.advance()?;

                if matches!(self.current_token.token_type, TokenType::LeftParen) {
                    return self.parse_call(name, position);
                }

                let mut path = vec![name];
                // Handle dot notation for variable paths
                while matches!(self.current_token.token_type, TokenType::Dot) {
                    self.advance()?;
                    if let TokenType::Identifier(segment) = &self.current_token.token_type {
                        path.push(segment.clone());
                        self.advance()?;
                    } else {
                        return Err(self.unexpected("identifier"));
                    }
                }

                if matches!(self.current_token.token_type, TokenType::Is) {
                    return self.parse_defined_test(path, position);
                }

                Ok(Expression::Variable { path, position })
            }
            TokenType::StringLiteral(value) => {
                let value = value.clone();
                self.advance()?;
                Ok(Expression::StringLiteral { value, position })
            }
            TokenType::IntegerLiteral(value) => {
                let value = *value;
                self.advance()?;
                Ok(Expression::IntegerLiteral { value, position })
            }
            TokenType::FloatLiteral(value) => {
                let value = *value;
                self.advance()?;
                Ok(Expression::FloatLiteral { value, position })
            }
            TokenType::BooleanLiteral(value) => {
                let value = *value;
                self.advance()?;
                Ok(Expression::BooleanLiteral { value, position })
            }
            TokenType::Null => {
                self.advance()?;
                Ok(Expression::NullLiteral { position })
            }
            TokenType::LeftParen => {
                self.advance()?;
                let expr = self.parse_expression()?;
                if matches!(self.current_token.token_type, TokenType::RightParen) {
                    self.advance()?;
                    Ok(expr)
                } else {
                    Err(self.unexpected("')'"))
                }
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_call(
        &mut self,
        name: String,
        position: Position,
    ) -> Result<Expression, TemplateSyntaxError> {
        let Some(&(_, min, max)) = FUNCTIONS.iter().find(|(known, _, _)| *known == name) else {
            return Err(TemplateSyntaxError::UnknownFunction { name, position });
        };
        self.advance()?; // Skip '('

        let mut arguments = Vec::new();
        if !matches!(self.current_token.token_type, TokenType::RightParen) {
            loop {
                arguments.push(self.parse_expression()?);
                if matches!(self.current_token.token_type, TokenType::Comma) {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }
        if !matches!(self.current_token.token_type, TokenType::RightParen) {
            return Err(self.unexpected("')'"));
        }
        self.advance()?;

        if arguments.len() < min || arguments.len() > max {
            return Err(TemplateSyntaxError::WrongArity {
                name,
                given: arguments.len(),
                position,
            });
        }
        Ok(Expression::FunctionCall {
            name,
            arguments,
            position,
        })
    }

    fn parse_defined_test(
        &mut self,
        path: Vec<String>,
        position: Position,
    ) -> Result<Expression, TemplateSyntaxError> {
        self.advance()?; // Skip 'is'
        let negated = if matches!(self.current_token.token_type, TokenType::LogicalNot) {
            self.advance()?;
            true
        } else {
            false
        };
        match &self.current_token.token_type {
            TokenType::Identifier(test) if test == "defined" => {
                self.advance()?;
                Ok(Expression::Defined {
                    path,
                    negated,
                    position,
                })
            }
            _ => Err(self.unexpected("'defined'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Vec<Node> {
        PayloadTemplate::parse(source).unwrap().nodes
    }

    #[test]
    fn plain_text_is_one_node() {
        assert_eq!(
            parse(r#"{"test": "value"}"#),
            vec![Node::Text(r#"{"test": "value"}"#.to_string())]
        );
    }

    #[test]
    fn output_tags_inside_json() {
        let nodes = parse(r#"{"message":"{{message}}","timestamp":"{{ now() }}"}"#);
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[0], Node::Text(r#"{"message":""#.to_string()));
        assert!(matches!(
            &nodes[1],
            Node::Output(Expression::Variable { path, .. }) if path == &vec!["message".to_string()]
        ));
        assert!(matches!(
            &nodes[3],
            Node::Output(Expression::FunctionCall { name, arguments, .. })
                if name == "now" && arguments.is_empty()
        ));
        assert_eq!(nodes[4], Node::Text(r#""}"#.to_string()));
    }

    #[test]
    fn closing_brace_after_output_tag() {
        let nodes = parse(r#"{"value": {{ value }}}"#);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[2], Node::Text("}".to_string()));
    }

    #[test]
    fn comments_are_dropped() {
        assert_eq!(
            parse("a{# note #}b"),
            vec![Node::Text("a".to_string()), Node::Text("b".to_string())]
        );
    }

    #[test]
    fn if_elif_else_chain() {
        let nodes = parse("{% if a %}1{% elif b %}2{% else %}3{% endif %}");
        match &nodes[0] {
            Node::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(otherwise, &vec![Node::Text("3".to_string())]);
            }
            other => panic!("expected if node, got {:?}", other),
        }
    }

    #[test]
    fn for_loop_body() {
        let nodes = parse("{% for t in tags %}{{ t }}{% endfor %}");
        match &nodes[0] {
            Node::For {
                binding,
                iterable,
                body,
            } => {
                assert_eq!(binding, "t");
                assert_eq!(iterable.to_string(), "tags");
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected for node, got {:?}", other),
        }
    }

    #[test]
    fn defined_tests() {
        let nodes = parse("{% if brightness is not defined %}x{% endif %}");
        match &nodes[0] {
            Node::If { branches, .. } => {
                assert!(matches!(
                    branches[0].0,
                    Expression::Defined { negated: true, .. }
                ));
            }
            other => panic!("expected if node, got {:?}", other),
        }
    }

    #[test]
    fn word_operators() {
        let nodes = parse("{% if a and not b or c %}x{% endif %}");
        match &nodes[0] {
            Node::If { branches, .. } => {
                assert_eq!(branches[0].0.to_string(), "((a && !(b)) || c)");
            }
            other => panic!("expected if node, got {:?}", other),
        }
    }

    #[test]
    fn operator_precedence() {
        let nodes = parse("{{ a + b * c ^ 2 }}");
        assert!(matches!(&nodes[0], Node::Output(e) if e.to_string() == "(a + (b * (c ^ 2)))"));
    }

    #[test]
    fn unclosed_output_tag() {
        let result = PayloadTemplate::parse(r#"{"a": "{{ a"}"#);
        assert!(matches!(
            result,
            Err(TemplateSyntaxError::UnclosedTag {
                delimiter: "}}",
                ..
            })
        ));
    }

    #[test]
    fn unclosed_if_block() {
        let result = PayloadTemplate::parse("{% if a %}x");
        assert!(matches!(
            result,
            Err(TemplateSyntaxError::UnclosedBlock { keyword: "if", .. })
        ));
    }

    #[test]
    fn stray_end_tag() {
        let result = PayloadTemplate::parse("x{% endfor %}");
        assert!(matches!(
            result,
            Err(TemplateSyntaxError::UnexpectedBlockTag {
                keyword: "endfor",
                ..
            })
        ));
        let result = PayloadTemplate::parse("{% for a in b %}{% endif %}");
        assert!(matches!(
            result,
            Err(TemplateSyntaxError::UnexpectedBlockTag {
                keyword: "endif",
                ..
            })
        ));
    }

    #[test]
    fn unknown_function() {
        let result = PayloadTemplate::parse("{{ env('HOME') }}");
        assert!(matches!(
            result,
            Err(TemplateSyntaxError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn wrong_arity() {
        let result = PayloadTemplate::parse("{{ default(a) }}");
        assert!(matches!(
            result,
            Err(TemplateSyntaxError::WrongArity { given: 1, .. })
        ));
    }

    #[test]
    fn empty_output_tag() {
        let result = PayloadTemplate::parse("{{   }}");
        assert!(matches!(
            result,
            Err(TemplateSyntaxError::EmptyExpression { .. })
        ));
    }

    #[test]
    fn unknown_block_keyword() {
        let result = PayloadTemplate::parse("{% while a %}");
        assert!(matches!(
            result,
            Err(TemplateSyntaxError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn trailing_dot_number() {
        let result = PayloadTemplate::parse("{{ 1. }}");
        assert!(matches!(
            result,
            Err(TemplateSyntaxError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn position_tracking_across_lines() {
        let result = PayloadTemplate::parse("{\n  \"a\": {{ a @ b }}\n}");
        match result {
            Err(TemplateSyntaxError::InvalidCharacter {
                character,
                position,
            }) => {
                assert_eq!(character, '@');
                assert_eq!(position, Position::new(2, 13));
            }
            other => panic!("expected invalid character, got {:?}", other),
        }
    }

    #[test]
    fn string_literals_with_either_quote() {
        let nodes = parse(r#"{{ default(a, 'x') }}{{ "y\"z" }}"#);
        assert!(matches!(
            &nodes[1],
            Node::Output(Expression::StringLiteral { value, .. }) if value == "y\"z"
        ));
    }
}
