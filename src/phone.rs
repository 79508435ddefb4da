//! Best-effort normalization of stored phone strings into the dialable form
//! the WhatsApp gateway expects: Brazilian country code plus a 10/11-digit
//! national number. The mapping is deterministic and idempotent, so it is
//! safe to run over already-normalized values.

pub const COUNTRY_CODE: &str = "55";

/// Minimum/maximum total digits for a dialable Brazilian number
/// (55 + area code + 8/9-digit subscriber).
const MIN_DIALABLE_LEN: usize = 12;
const MAX_DIALABLE_LEN: usize = 13;

/// Normalize a raw stored phone string to dialable form, or `None` when the
/// number cannot be a valid Brazilian destination.
pub fn normalize(raw: &str) -> Option<String> {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    // International dialing prefix, e.g. "0055...".
    if let Some(rest) = digits.strip_prefix("00") {
        digits = rest.to_string();
    }

    // Carrier trunk prefix on otherwise-local numbers, e.g. "011 98765-4321".
    if digits.starts_with('0') && (digits.len() == 11 || digits.len() == 12) {
        digits.remove(0);
    }

    // Bare local number: assume Brazil.
    if digits.len() == 10 || digits.len() == 11 {
        digits = format!("{COUNTRY_CODE}{digits}");
    }

    if !digits.starts_with(COUNTRY_CODE) {
        return None;
    }

    // Old-format mobile (55 + AA + 8 digits): insert the ninth digit the
    // carriers added, after the area code.
    if digits.len() == 12 {
        digits.insert(4, '9');
    }

    if digits.len() < MIN_DIALABLE_LEN || digits.len() > MAX_DIALABLE_LEN {
        return None;
    }

    Some(digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_raw_forms_converge() {
        let expected = Some("5511987654321".to_string());
        assert_eq!(normalize("11987654321"), expected);
        assert_eq!(normalize("011987654321"), expected);
        assert_eq!(normalize("+5511987654321"), expected);
        assert_eq!(normalize("(11) 98765-4321"), expected);
        assert_eq!(normalize("005511987654321"), expected);
    }

    #[test]
    fn old_format_mobile_gains_ninth_digit() {
        // 10-digit local subscriber, with and without explicit country code.
        assert_eq!(normalize("1187654321"), Some("5511987654321".to_string()));
        assert_eq!(normalize("551187654321"), Some("5511987654321".to_string()));
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "11987654321",
            "011987654321",
            "+55 (11) 98765-4321",
            "1187654321",
            "005511987654321",
        ] {
            let once = normalize(raw).unwrap();
            assert_eq!(normalize(&once), Some(once.clone()));
        }
    }

    #[test]
    fn rejects_undialable_numbers() {
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("sem telefone"), None);
        assert_eq!(normalize("987654"), None);
        // Foreign country code at full international length.
        assert_eq!(normalize("441632960961"), None);
        // Too many digits even for an international form.
        assert_eq!(normalize("55119876543210"), None);
    }
}
