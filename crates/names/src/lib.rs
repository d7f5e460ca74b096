use sha2::{Digest, Sha256};

/// Character that joins the components of a composite (relation) name.
/// Each component is snake-cased independently and the components are
/// re-joined with this indicator.
pub const RELATION_INDICATOR: char = '_';

/// PostgreSQL truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Postfix for index names.
pub const TABLE_INDEX_POSTFIX: &str = "_idx";

/// Postfix for temporary replacement tables.
pub const TMP_TABLE_POSTFIX: &str = "_new";

/// Database schema used for datasets that are not versioned.
pub const DEFAULT_DATABASE_SCHEMA: &str = "public";

/// Split a single name component into words on case and letter/digit
/// transitions. `"ligtInBouwblok"` becomes `["ligt", "In", "Bouwblok"]`,
/// `"heeftBAGVbo"` becomes `["heeft", "BAG", "Vbo"]` and `"bag2"` becomes
/// `["bag", "2"]`. Existing underscores are treated by the callers, not here.
fn split_words(part: &str) -> Vec<String> {
    let chars: Vec<char> = part.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        let prev = if i > 0 { Some(chars[i - 1]) } else { None };
        let next = chars.get(i + 1).copied();

        let boundary = match prev {
            None => false,
            Some(p) => {
                (c.is_uppercase() && !p.is_uppercase())
                    || (c.is_uppercase() && p.is_uppercase() && next.map_or(false, |n| n.is_lowercase()))
                    || (c.is_ascii_digit() && p.is_lowercase())
                    || (c.is_lowercase() && p.is_ascii_digit())
            }
        };

        if boundary && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Convert a name from snake_case / camelCase / space separated form
/// into camelCase.
pub fn to_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut first = true;
    for part in name.split(|c: char| c == RELATION_INDICATOR || c == ' ') {
        for word in split_words(part) {
            if first {
                out.extend(word.chars().flat_map(|c| c.to_lowercase()));
                first = false;
            } else {
                let mut chars = word.chars();
                if let Some(c) = chars.next() {
                    out.extend(c.to_uppercase());
                    out.extend(chars.flat_map(|c| c.to_lowercase()));
                }
            }
        }
    }
    out
}

/// Convert a name from camelCase / space separated form into snake_case.
///
/// The relation indicator is preserved: every indicator-separated component
/// is snake-cased on its own and the components are re-joined. This keeps
/// composite names such as `ligtIn_bouwblok` stable under repeated
/// conversion.
pub fn to_snake_case(name: &str) -> String {
    name.split(RELATION_INDICATOR)
        .map(|part| {
            split_words(&part.replace(' ', ""))
                .iter()
                .map(|w| w.to_lowercase())
                .collect::<Vec<_>>()
                .join("_")
        })
        .collect::<Vec<_>>()
        .join(&RELATION_INDICATOR.to_string())
}

/// Bound a derived database identifier to PostgreSQL's length limit.
///
/// Names that fit are returned unchanged. Longer names are replaced by a
/// 20-byte digest in hex with `postfix` appended, so shortened names remain
/// recognizable by their suffix (`_idx`, `_full_load`). The digest is over
/// the full original name, making the replacement deterministic.
pub fn shorten_name(name: &str, postfix: &str) -> String {
    if name.len() <= MAX_IDENTIFIER_LENGTH {
        return name.to_string();
    }
    let digest = Sha256::digest(name.as_bytes());
    format!("{}{}", hex::encode(&digest[..20]), postfix)
}

/// Identifier for a derived (nested or through) table: `<table>_<field>`,
/// bounded so that it still fits once the dataset prefix is applied.
pub fn rel_table_identifier(dataset_prefix_len: usize, table_id: &str, field_id: &str) -> String {
    let identifier = format!("{table_id}_{field_id}");
    let max = MAX_IDENTIFIER_LENGTH.saturating_sub(dataset_prefix_len);
    if identifier.len() <= max {
        identifier
    } else {
        let mut end = max;
        while !identifier.is_char_boundary(end) {
            end -= 1;
        }
        identifier[..end].to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_to_snake_case() {
        let table = vec![
            ("ligtInBouwblok", "ligt_in_bouwblok"),
            ("ligt_in_bouwblok", "ligt_in_bouwblok"),
            ("verblijfsobjecten", "verblijfsobjecten"),
            ("heeftEenRelatie", "heeft_een_relatie"),
            ("FOO", "foo"),
            ("schema2Thing", "schema_2_thing"),
            // Composite relation names keep the indicator between components.
            ("ligtInBouwblok_identificatie", "ligt_in_bouwblok_identificatie"),
            ("", ""),
        ];
        for (input, expect) in table {
            assert_eq!(to_snake_case(input), expect, "input: {input}");
        }
    }

    #[test]
    fn test_to_camel_case() {
        let table = vec![
            ("ligt_in_bouwblok", "ligtInBouwblok"),
            ("ligtInBouwblok", "ligtInBouwblok"),
            ("eind_geldigheid", "eindGeldigheid"),
            ("identificatie", "identificatie"),
            ("", ""),
        ];
        for (input, expect) in table {
            assert_eq!(to_camel_case(input), expect, "input: {input}");
        }
    }

    #[test]
    fn test_round_trip() {
        // Every well-formed camelCase field identifier must survive the
        // snake -> camel round trip unchanged.
        for id in [
            "identificatie",
            "ligtInBouwblok",
            "beginGeldigheid",
            "heeftHoofdadres",
            "gebruiksdoel",
        ] {
            assert_eq!(to_camel_case(&to_snake_case(id)), id);
        }
    }

    #[test]
    fn test_shorten_name_passthrough() {
        assert_eq!(shorten_name("gebieden_bouwblokken", "_idx"), "gebieden_bouwblokken");
    }

    #[test]
    fn test_shorten_name_hashes_long_names() {
        let long = "a".repeat(80);
        let short = shorten_name(&long, TABLE_INDEX_POSTFIX);
        assert!(short.len() <= MAX_IDENTIFIER_LENGTH);
        assert_eq!(short.len(), 44); // 40 hex chars + "_idx"
        assert!(short.ends_with(TABLE_INDEX_POSTFIX));
        // Deterministic.
        assert_eq!(short, shorten_name(&long, TABLE_INDEX_POSTFIX));
        // Distinct inputs yield distinct names.
        assert_ne!(short, shorten_name(&"b".repeat(80), TABLE_INDEX_POSTFIX));
    }

    #[test]
    fn test_rel_table_identifier() {
        assert_eq!(
            rel_table_identifier(9, "ggwgebieden", "bestaatUitBuurten"),
            "ggwgebieden_bestaatUitBuurten"
        );
        let bounded = rel_table_identifier(9, &"x".repeat(50), &"y".repeat(30));
        assert_eq!(bounded.len(), MAX_IDENTIFIER_LENGTH - 9);
    }
}
