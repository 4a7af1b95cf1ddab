//! Minimal validation of Kubernetes resource quantities (`250m`, `1.5Gi`, `1e3`).

const SUFFIXES: &[&str] =
    &["Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "n", "u", "m", "k", "M", "G", "T", "P", "E", ""];

/// Check the quantity grammar and report whether the value is negative.
pub fn validate(value: &str) -> Result<bool, String> {
    let value = value.trim();
    let (negative, unsigned) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        Some(_) => (false, value),
        None => return Err("empty quantity".to_string()),
    };

    let number_end = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_end);

    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return Err(format!("invalid number in quantity {value:?}"));
    }
    if !SUFFIXES.contains(&suffix) && !is_exponent(suffix) {
        return Err(format!("invalid suffix {suffix:?} in quantity {value:?}"));
    }

    let is_zero = number.chars().all(|c| c == '0' || c == '.');
    Ok(negative && !is_zero)
}

fn is_exponent(suffix: &str) -> bool {
    let Some(rest) = suffix.strip_prefix(['e', 'E']) else {
        return false;
    };
    let digits = rest.strip_prefix(['+', '-']).unwrap_or(rest);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}
