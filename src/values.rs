//! Locale-aware (pt-BR) conversion of scraped text into numbers.
//! Both parsers are total: bad input yields zero, never an error.

/// `"R$ 1.234,56"` → 1234.56. Dots are thousands separators, the comma is the
/// decimal mark. Returns 0.0 for empty or unparsable input.
pub fn parse_money(text: &str) -> f64 {
    let clean: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if clean.is_empty() {
        return 0.0;
    }

    let normalized = clean.replace('.', "").replace(',', ".");
    normalized.parse::<f64>().unwrap_or(0.0)
}

/// Leading run of digits: `"93 93%"` → 93. Returns 0 when the text does not
/// start with a digit.
pub fn parse_quantity(text: &str) -> u64 {
    let digits: String = text
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}
