//! ASCII numeric arrays
//!
//! Instruments answer `CURV?`-style queries with comma or whitespace separated
//! numbers. Tokens that do not convert are dropped instead of failing the
//! whole response.

/// How to split an ASCII response into tokens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Separator {
    /// Runs of whitespace and/or commas.
    #[default]
    WhitespaceOrComma,
    /// An exact separator string.
    Exact(String),
}

impl Separator {
    fn split<'a>(&'a self, text: &'a str) -> Box<dyn Iterator<Item = &'a str> + 'a> {
        match self {
            Separator::WhitespaceOrComma => Box::new(
                text.split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|t| !t.is_empty()),
            ),
            Separator::Exact(sep) if sep.is_empty() => Box::new(std::iter::once(text)),
            Separator::Exact(sep) => Box::new(text.split(sep.as_str())),
        }
    }
}

/// Standard float conversion; unparsable tokens become NaN.
pub fn default_converter(token: &str) -> f64 {
    token.trim().parse::<f64>().unwrap_or(f64::NAN)
}

/// Parse with the default separator and converter.
pub fn parse_ascii_values(text: &str) -> Vec<f64> {
    parse_ascii_values_with(text, &Separator::default(), default_converter)
}

/// Parse with a custom separator and converter; NaN results are dropped.
pub fn parse_ascii_values_with<F>(text: &str, separator: &Separator, converter: F) -> Vec<f64>
where
    F: Fn(&str) -> f64,
{
    separator
        .split(text.trim())
        .map(|token| converter(token.trim()))
        .filter(|v| !v.is_nan())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::scpi::parse_number;

    #[test]
    fn test_default_separator() {
        assert_eq!(
            parse_ascii_values("1.0, 2.5,-3e2\n 4"),
            vec![1.0, 2.5, -300.0, 4.0]
        );
    }

    #[test]
    fn test_bad_tokens_are_dropped() {
        assert_eq!(parse_ascii_values("1,abc,3,,"), vec![1.0, 3.0]);
        assert!(parse_ascii_values("").is_empty());
    }

    #[test]
    fn test_exact_separator() {
        let sep = Separator::Exact(";".to_string());
        assert_eq!(
            parse_ascii_values_with("1;2; 3", &sep, default_converter),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn test_custom_converter() {
        let values = parse_ascii_values_with("9.9E37,1", &Separator::default(), parse_number);
        assert_eq!(values[0], f64::INFINITY);
        assert_eq!(values[1], 1.0);
    }
}
