use crate::handle::DuPair;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::fmt::Write;
use thiserror::Error;

/// Template used when none is configured.
pub const DEFAULT_PUT_TEMPLATE: &str = "\
// {field} defined by {def}, used by {use}
put {name}(target: {type}, def_args: params, use_args: params) {{
    call target.{def_short}(def_args)
    call target.{use_short}(use_args)
    observe target.{field_short}
}}
";

/// Range of seed argument values drawn by [`SeededTemplateStrategy`].
const SEED_VALUE_RANGE: std::ops::RangeInclusive<i64> = -1024..=1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Unknown placeholder '{{{0}}}' in PUT template")]
    UnknownPlaceholder(String),
    #[error("Unterminated placeholder starting at byte {0} of PUT template")]
    UnterminatedPlaceholder(usize),
    #[error("Generated PUT body for {0} is empty")]
    EmptyBody(String),
    #[error("Generation strategy '{strategy}' failed for {pair}: {reason}")]
    Strategy {
        strategy: &'static str,
        pair: String,
        reason: String,
    },
}

/// A `GenerationStrategy` turns one DU pair into the body of a parameterized
/// unit test.
///
/// The body is opaque to the rest of the system: it is deduplicated by exact
/// text and handed to the test engine as-is. Strategies should be
/// deterministic, so that regenerating for an unchanged pair produces the
/// same body and is caught by deduplication.
pub trait GenerationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate(&self, pair: &DuPair) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    Type,
    Field,
    Def,
    Use,
    FieldShort,
    DefShort,
    UseShort,
    Name,
}

impl Placeholder {
    fn parse(key: &str) -> Option<Self> {
        Some(match key {
            "type" => Placeholder::Type,
            "field" => Placeholder::Field,
            "def" => Placeholder::Def,
            "use" => Placeholder::Use,
            "field_short" => Placeholder::FieldShort,
            "def_short" => Placeholder::DefShort,
            "use_short" => Placeholder::UseShort,
            "name" => Placeholder::Name,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Placeholder),
}

/// Renders PUT bodies from a text template.
///
/// `{type}`, `{field}`, `{def}` and `{use}` expand to qualified names,
/// `{field_short}`, `{def_short}` and `{use_short}` to their last path
/// segment, and `{name}` to an identifier unique to the pair. `{{` and `}}`
/// produce literal braces.
#[derive(Debug, Clone)]
pub struct TemplateStrategy {
    segments: Vec<Segment>,
}

impl TemplateStrategy {
    pub fn new(template: &str) -> Result<Self, GenerationError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().is_some_and(|(_, next)| *next == '{') => {
                    chars.next();
                    literal.push('{');
                }
                '{' => {
                    let mut key = String::new();
                    let mut closed = false;
                    for (_, k) in chars.by_ref() {
                        if k == '}' {
                            closed = true;
                            break;
                        }
                        key.push(k);
                    }
                    if !closed {
                        return Err(GenerationError::UnterminatedPlaceholder(pos));
                    }
                    let slot = Placeholder::parse(&key)
                        .ok_or(GenerationError::UnknownPlaceholder(key))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Slot(slot));
                }
                '}' if chars.peek().is_some_and(|(_, next)| *next == '}') => {
                    chars.next();
                    literal.push('}');
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    fn render(&self, pair: &DuPair) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(slot) => out.push_str(&expand(*slot, pair)),
            }
        }
        out
    }
}

impl Default for TemplateStrategy {
    fn default() -> Self {
        // DEFAULT_PUT_TEMPLATE only uses known placeholders
        Self::new(DEFAULT_PUT_TEMPLATE).unwrap_or(Self {
            segments: Vec::new(),
        })
    }
}

impl GenerationStrategy for TemplateStrategy {
    fn name(&self) -> &'static str {
        "template"
    }

    fn generate(&self, pair: &DuPair) -> Result<String, GenerationError> {
        let body = self.render(pair);
        if body.trim().is_empty() {
            return Err(GenerationError::EmptyBody(pair.to_string()));
        }
        Ok(body)
    }
}

fn expand(slot: Placeholder, pair: &DuPair) -> String {
    match slot {
        Placeholder::Type => pair.declaring_type().to_string(),
        Placeholder::Field => pair.field().name().to_string(),
        Placeholder::Def => pair.def_method().name().to_string(),
        Placeholder::Use => pair.use_method().name().to_string(),
        Placeholder::FieldShort => short_name(pair.field().name()).to_string(),
        Placeholder::DefShort => short_name(pair.def_method().name()).to_string(),
        Placeholder::UseShort => short_name(pair.use_method().name()).to_string(),
        Placeholder::Name => put_name(pair),
    }
}

/// Last segment of a qualified name, splitting on `.` and `::`.
fn short_name(qualified: &str) -> &str {
    qualified
        .rsplit(['.', ':'])
        .find(|segment| !segment.is_empty())
        .unwrap_or(qualified)
}

/// Identifier-safe version of `text`.
pub fn sanitize_identifier(text: &str) -> String {
    let mut out: String = text
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) || out.is_empty() {
        out.insert(0, '_');
    }
    out
}

fn put_name(pair: &DuPair) -> String {
    sanitize_identifier(&format!(
        "du_{}_{}_{}",
        short_name(pair.field().name()),
        short_name(pair.def_method().name()),
        short_name(pair.use_method().name())
    ))
}

/// Wraps a [`TemplateStrategy`] and appends rows of seed arguments for the
/// exploration engine to start from.
///
/// Seeds are drawn from a ChaCha8 stream keyed by the MD5 digest of the pair,
/// so a given pair always receives the same seeds.
#[derive(Debug, Clone)]
pub struct SeededTemplateStrategy {
    inner: TemplateStrategy,
    rows: usize,
    args_per_row: usize,
}

impl SeededTemplateStrategy {
    pub fn new(inner: TemplateStrategy, rows: usize, args_per_row: usize) -> Self {
        Self {
            inner,
            rows,
            args_per_row,
        }
    }

    fn rng_for(pair: &DuPair) -> ChaCha8Rng {
        let digest = md5::compute(pair.to_string().as_bytes());
        let mut seed = [0u8; 32];
        seed[..16].copy_from_slice(&digest.0);
        seed[16..].copy_from_slice(&digest.0);
        ChaCha8Rng::from_seed(seed)
    }
}

impl GenerationStrategy for SeededTemplateStrategy {
    fn name(&self) -> &'static str {
        "seeded-template"
    }

    fn generate(&self, pair: &DuPair) -> Result<String, GenerationError> {
        let mut body = self.inner.generate(pair)?;
        if self.rows == 0 {
            return Ok(body);
        }
        let mut rng = Self::rng_for(pair);
        if !body.ends_with('\n') {
            body.push('\n');
        }
        for row in 0..self.rows {
            let values: Vec<String> = (0..self.args_per_row)
                .map(|_| rng.random_range(SEED_VALUE_RANGE).to_string())
                .collect();
            writeln!(body, "seed #{row}: [{}]", values.join(", ")).map_err(|e| {
                GenerationError::Strategy {
                    strategy: self.name(),
                    pair: pair.to_string(),
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{DeclaringType, FieldHandle, MethodHandle};

    fn pair(field: &str, def: &str, use_method: &str) -> DuPair {
        let ty = DeclaringType::from("Shop.Cart");
        DuPair::new(
            FieldHandle::new(field, ty.clone()),
            MethodHandle::new(def, ty.clone()),
            MethodHandle::new(use_method, ty),
        )
        .unwrap()
    }

    #[test]
    fn template_expands_every_placeholder() {
        let strategy = TemplateStrategy::new(
            "{type}|{field}|{def}|{use}|{field_short}|{def_short}|{use_short}|{name}",
        )
        .unwrap();
        let body = strategy
            .generate(&pair("Shop.Cart.total", "Shop.Cart.Add", "Shop.Cart.Checkout"))
            .unwrap();
        assert_eq!(
            body,
            "Shop.Cart|Shop.Cart.total|Shop.Cart.Add|Shop.Cart.Checkout|total|Add|Checkout|du_total_Add_Checkout"
        );
    }

    #[test]
    fn doubled_braces_are_literal() {
        let strategy = TemplateStrategy::new("fn {name}() {{ }}").unwrap();
        let body = strategy.generate(&pair("F", "Set", "Get")).unwrap();
        assert_eq!(body, "fn du_F_Set_Get() { }");
    }

    #[test]
    fn invalid_templates_are_rejected_up_front() {
        assert_eq!(
            TemplateStrategy::new("{bogus}").unwrap_err(),
            GenerationError::UnknownPlaceholder("bogus".to_string())
        );
        assert_eq!(
            TemplateStrategy::new("abc {type").unwrap_err(),
            GenerationError::UnterminatedPlaceholder(4)
        );
    }

    #[test]
    fn blank_output_is_a_generation_failure() {
        let strategy = TemplateStrategy::new("   \n").unwrap();
        assert!(matches!(
            strategy.generate(&pair("F", "Set", "Get")),
            Err(GenerationError::EmptyBody(_))
        ));
    }

    #[test]
    fn default_template_distinguishes_pairs() {
        let strategy = TemplateStrategy::default();
        let a = strategy
            .generate(&pair("Shop.Cart.total", "Shop.Cart.Add", "Shop.Cart.Checkout"))
            .unwrap();
        let b = strategy
            .generate(&pair("Shop.Cart.total", "Shop.Cart.Clear", "Shop.Cart.Checkout"))
            .unwrap();
        assert_ne!(a, b);
        assert!(a.contains("put du_total_Add_Checkout(target: Shop.Cart"));
        assert!(a.contains("call target.Add(def_args)"));
    }

    #[test]
    fn short_names_and_identifiers() {
        assert_eq!(short_name("a::b::c"), "c");
        assert_eq!(short_name("Ns.Type.Method"), "Method");
        assert_eq!(short_name("plain"), "plain");
        assert_eq!(sanitize_identifier("get<T>"), "get_T_");
        assert_eq!(sanitize_identifier("9lives"), "_9lives");
    }

    #[test]
    fn seeded_strategy_is_deterministic_per_pair() {
        let strategy = SeededTemplateStrategy::new(TemplateStrategy::default(), 3, 2);
        let p = pair("Shop.Cart.total", "Shop.Cart.Add", "Shop.Cart.Checkout");
        let first = strategy.generate(&p).unwrap();
        let second = strategy.generate(&p).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.lines().filter(|l| l.starts_with("seed #")).count(), 3);

        let other = strategy
            .generate(&pair("Shop.Cart.total", "Shop.Cart.Clear", "Shop.Cart.Checkout"))
            .unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn seeded_strategy_without_rows_matches_inner() {
        let inner = TemplateStrategy::default();
        let p = pair("F", "Set", "Get");
        let seeded = SeededTemplateStrategy::new(inner.clone(), 0, 4);
        assert_eq!(seeded.generate(&p).unwrap(), inner.generate(&p).unwrap());
    }
}
