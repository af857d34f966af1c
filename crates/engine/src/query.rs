//! Helpers for building list queries: whitelisted ordering and search patterns.

/// Translate a `?ordering=` value such as `-created_at,name` into an `ORDER BY` body.
///
/// Each entry in `allowed` maps a public field name to the SQL column it sorts by.
/// Unknown fields are dropped; if nothing usable remains, `default` is used.
pub fn order_by(requested: Option<&str>, allowed: &[(&str, &str)], default: &str) -> String {
    let clauses = parse(requested.unwrap_or(default), allowed);
    if clauses.is_empty() {
        parse(default, allowed).join(", ")
    } else {
        clauses.join(", ")
    }
}

fn parse(ordering: &str, allowed: &[(&str, &str)]) -> Vec<String> {
    ordering.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            let (field, direction) = match part.strip_prefix('-') {
                Some(field) => (field, "DESC"),
                None => (part, "ASC"),
            };
            allowed
                .iter()
                .find(|(name, _)| *name == field)
                .map(|(_, column)| format!("{} {}", column, direction))
        })
        .collect()
}

/// `ILIKE` pattern matching `term` anywhere, with wildcards in `term` escaped.
pub fn contains_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIELDS: &[(&str, &str)] = &[
        ("name", "p.name"),
        ("created_at", "p.created_at"),
        ("due_date", "p.due_date"),
    ];

    #[test]
    fn test_default_ordering() {
        assert_eq!(order_by(None, FIELDS, "-created_at"), "p.created_at DESC");
    }

    #[test]
    fn test_multiple_fields() {
        assert_eq!(
            order_by(Some("due_date,-name"), FIELDS, "-created_at"),
            "p.due_date ASC, p.name DESC"
        );
    }

    #[test]
    fn test_unknown_fields_fall_back() {
        assert_eq!(
            order_by(Some("password_hash; DROP TABLE users"), FIELDS, "-created_at"),
            "p.created_at DESC"
        );
    }

    #[test]
    fn test_contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("50%_off"), "%50\\%\\_off%");
    }
}
