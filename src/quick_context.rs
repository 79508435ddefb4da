//! The quick-context note doubles as an overflow store for semi-structured
//! attributes. The only one the rest of the system depends on is the city,
//! embedded as a leading `Cidade: X` part. Parts are pipe-delimited.

const CITY_LABEL: &str = "Cidade";
const PART_SEPARATOR: &str = " | ";

fn is_city_part(part: &str) -> bool {
    let trimmed = part.trim_start();
    match trimmed.get(..CITY_LABEL.len()) {
        Some(head) if head.eq_ignore_ascii_case(CITY_LABEL) => {
            trimmed[CITY_LABEL.len()..].trim_start().starts_with(':')
        }
        _ => false,
    }
}

/// Read the city out of a quick-context note, if a city token is present.
pub fn extract_city(quick_context: &str) -> Option<String> {
    for part in quick_context.split('|') {
        if is_city_part(part) {
            let value = part.trim().splitn(2, ':').nth(1)?.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Rewrite a quick-context note so it carries exactly one city token (or
/// none). Any pre-existing token is stripped first, so repeated writes never
/// accumulate duplicates and the stored token never diverges from the city
/// the caller passed in.
pub fn sync_city(quick_context: Option<&str>, city: Option<&str>) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();

    if let Some(city) = city.map(str::trim).filter(|c| !c.is_empty()) {
        parts.push(format!("{CITY_LABEL}: {city}"));
    }

    if let Some(ctx) = quick_context {
        for part in ctx.split('|') {
            let part = part.trim();
            if !part.is_empty() && !is_city_part(part) {
                parts.push(part.to_string());
            }
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(PART_SEPARATOR))
    }
}

/// Merge a caller-supplied note and city attribute into one stored note.
/// An explicit city wins; otherwise a token already embedded in the note is
/// kept. Either way the result carries at most one token.
pub fn reconcile(quick_context: Option<&str>, city: Option<&str>) -> Option<String> {
    let city = city
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .or_else(|| quick_context.and_then(extract_city));
    sync_city(quick_context, city.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_city_from_any_position() {
        assert_eq!(extract_city("Cidade: Santos"), Some("Santos".to_string()));
        assert_eq!(
            extract_city("Sexo: F | cidade: Campinas | Idade: 41"),
            Some("Campinas".to_string())
        );
        assert_eq!(extract_city("Sexo: F | Idade: 41"), None);
        assert_eq!(extract_city("Cidade:"), None);
    }

    #[test]
    fn sync_replaces_divergent_token_without_duplicating() {
        let out = sync_city(Some("Cidade: Santos | Dor lombar há 3 meses"), Some("Campinas"));
        let out = out.unwrap();
        assert_eq!(out.matches("Cidade:").count(), 1);
        assert!(out.starts_with("Cidade: Campinas"));
        assert!(out.contains("Dor lombar há 3 meses"));
    }

    #[test]
    fn sync_without_city_strips_existing_token() {
        let out = sync_city(Some("Cidade: Santos | Atleta amador"), None);
        assert_eq!(out.as_deref(), Some("Atleta amador"));
        assert_eq!(sync_city(Some("Cidade: Santos"), None), None);
        assert_eq!(sync_city(None, None), None);
    }

    #[test]
    fn reconcile_prefers_explicit_city_but_keeps_embedded_one() {
        assert_eq!(
            reconcile(Some("Cidade: Santos | Corredor"), Some("Campinas")).as_deref(),
            Some("Cidade: Campinas | Corredor")
        );
        assert_eq!(
            reconcile(Some("Cidade: Santos | Corredor"), None).as_deref(),
            Some("Cidade: Santos | Corredor")
        );
        assert_eq!(reconcile(None, Some("Santos")).as_deref(), Some("Cidade: Santos"));
    }

    #[test]
    fn sync_is_stable_when_city_matches() {
        let once = sync_city(Some("Sexo: M | Corredor"), Some("Santos")).unwrap();
        let twice = sync_city(Some(&once), Some("Santos")).unwrap();
        assert_eq!(once, twice);
    }
}
