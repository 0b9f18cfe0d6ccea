//! Indentation stripping for manifests and scripts written inline.

/// Removes the common indentation of `text`.
///
/// A leading empty line is dropped first, so a literal can start on the line
/// after its opening quote. The base indentation is the smallest number of
/// leading spaces or tabs (each counts as one) over all non-empty lines; that
/// many characters are then removed from every line longer than it.
///
/// ```
/// use mesh_test::heredoc::doc;
///
/// assert_eq!(doc("  one\n    two"), "one\n  two");
/// assert_eq!(
///     doc("
///         kind: Namespace
///         metadata:
///           name: foo"),
///     "kind: Namespace\nmetadata:\n  name: foo",
/// );
/// ```
pub fn doc(text: &str) -> String {
    let text = text.strip_prefix('\n').unwrap_or(text);
    let lines = text.split('\n').collect::<Vec<_>>();

    let base = lines
        .iter()
        .filter(|line| !line.is_empty())
        .map(|line| line.bytes().take_while(|b| *b == b' ' || *b == b'\t').count())
        .min()
        .unwrap_or(0);

    lines
        .into_iter()
        .map(|line| if line.len() > base { &line[base..] } else { line })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::doc;

    #[test]
    fn strips_common_indentation() {
        assert_eq!(doc("no indentation"), "no indentation");
        assert_eq!(doc("  two spaces"), "two spaces");
        assert_eq!(doc("\t\t\tthree tabs"), "three tabs");
        assert_eq!(doc("  one\n    two"), "one\n  two");
        assert_eq!(doc("    two\n  one"), "  two\none");
    }

    #[test]
    fn drops_leading_empty_line() {
        let text = "
               one
                 two";
        assert_eq!(doc(text), "one\n  two");
    }

    #[test]
    fn tabs_and_spaces_count_alike() {
        assert_eq!(doc("\t one\n  two"), "one\ntwo");
        assert_eq!(doc("\tone\n    two"), "one\n   two");
    }

    #[test]
    fn empty_lines_do_not_pin_the_indent() {
        let text = "
            apiVersion: v1
            kind: Namespace

            ---
            kind: Namespace";
        assert_eq!(
            doc(text),
            "apiVersion: v1\nkind: Namespace\n\n---\nkind: Namespace"
        );
    }

    #[test]
    fn degenerate_input() {
        assert_eq!(doc(""), "");
        assert_eq!(doc("\n"), "");
        assert_eq!(doc("   "), "   ");
    }
}
