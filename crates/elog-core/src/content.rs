//! Normalizer for the free-text "main content" block of an info
//! artifact. The crawler flattens the experiment details page into
//! repeated `Label:` lines, each followed by zero or more continuation
//! lines holding the value.

use std::collections::BTreeMap;

/// Scans `text` line by line and returns a label → value mapping.
///
/// A line whose trimmed form ends in a colon opens a new label and
/// flushes the previous one; every other line is appended
/// (space-joined) to the currently open label. Labels with no
/// continuation lines map to an empty string. Text before the first
/// label is discarded.
pub fn parse_main_content(text: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let mut open_label: Option<String> = None;
    let mut buffer: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(label) = label_of(trimmed) {
            if let Some(previous) = open_label.take() {
                fields.insert(previous, buffer.join(" "));
            }
            buffer.clear();
            open_label = Some(label.to_string());
        } else if open_label.is_some() && !trimmed.is_empty() {
            buffer.push(trimmed);
        }
    }

    if let Some(last) = open_label {
        fields.insert(last, buffer.join(" "));
    }

    fields
}

fn label_of(trimmed: &str) -> Option<&str> {
    let label = trimmed.strip_suffix(':')?.trim_end();
    if label.is_empty() {
        return None;
    }
    Some(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_label_at_start_of_text_keeps_its_value() {
        let fields = parse_main_content("Instrument:\nMFX\nPI:\nA. Scientist\n");
        assert_eq!(fields.get("Instrument").map(String::as_str), Some("MFX"));
        assert_eq!(fields.get("PI").map(String::as_str), Some("A. Scientist"));
    }

    #[test]
    fn continuation_lines_are_space_joined() {
        let fields = parse_main_content(
            "Description:\nSerial crystallography\nat room temperature\nName:\nl1027522\n",
        );
        assert_eq!(
            fields.get("Description").map(String::as_str),
            Some("Serial crystallography at room temperature")
        );
        assert_eq!(fields.get("Name").map(String::as_str), Some("l1027522"));
    }

    #[test]
    fn label_with_no_continuation_maps_to_empty_string() {
        let fields = parse_main_content("Slack channels:\nAnalysis Queues:\nmilano\n");
        assert_eq!(fields.get("Slack channels").map(String::as_str), Some(""));
        assert_eq!(
            fields.get("Analysis Queues").map(String::as_str),
            Some("milano")
        );
    }

    #[test]
    fn final_open_label_is_flushed_at_end_of_input() {
        let fields = parse_main_content("URAWI Proposal:\nLU75");
        assert_eq!(fields.get("URAWI Proposal").map(String::as_str), Some("LU75"));
    }

    #[test]
    fn text_before_the_first_label_is_discarded() {
        let fields = parse_main_content("header noise\nInstrument:\nXPP\n");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("Instrument").map(String::as_str), Some("XPP"));
    }

    #[test]
    fn inline_values_are_not_labels() {
        // "PI: Someone" does not end in a colon, so it is a
        // continuation line, not a new label.
        let fields = parse_main_content("Start Time:\nOct 10, 2024 9:00 AM\nPI: Someone\n");
        assert_eq!(
            fields.get("Start Time").map(String::as_str),
            Some("Oct 10, 2024 9:00 AM PI: Someone")
        );
    }

    #[test]
    fn bare_colon_line_is_not_a_label() {
        let fields = parse_main_content("Name:\n:\nvalue\n");
        assert_eq!(fields.get("Name").map(String::as_str), Some(": value"));
    }
}
