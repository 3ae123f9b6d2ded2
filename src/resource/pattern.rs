//! VISA resource query patterns
//!
//! `?` matches exactly one character and `*` matches zero or more characters,
//! including `::` separators, so `USB?*::INSTR` selects every USB instrument.
//! The interface-type tag (`USB`, `ASRL`, `TCPIP`, `SIM`) and the resource
//! class (`INSTR`, `SOCKET`) compare case-insensitively; every other segment
//! (serial numbers, hosts, device paths) compares exactly.

/// Query used by `list_resources` when the caller supplies none.
pub const DEFAULT_QUERY: &str = "?*::INSTR";

/// Returns true if `resource` matches the VISA glob `pattern`.
pub fn matches_pattern(resource: &str, pattern: &str) -> bool {
    let text: Vec<char> = resource.trim().chars().collect();
    let pat: Vec<char> = pattern.trim().chars().collect();
    let folded = case_insensitive_mask(&text);

    let eq = |ti: usize, pc: char| {
        let tc = text[ti];
        if folded[ti] {
            tc.eq_ignore_ascii_case(&pc)
        } else {
            tc == pc
        }
    };

    let (mut ti, mut pi) = (0usize, 0usize);
    // Last `*` seen and the text position it is currently absorbing up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pi < pat.len() && (pat[pi] == '?' || (pat[pi] != '*' && eq(ti, pat[pi]))) {
            ti += 1;
            pi += 1;
        } else if pi < pat.len() && pat[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = backtrack {
            pi = star_pi + 1;
            ti = star_ti + 1;
            backtrack = Some((star_pi, ti));
        } else {
            return false;
        }
    }

    pat[pi..].iter().all(|&c| c == '*')
}

/// Marks the characters of the interface tag and the resource class.
fn case_insensitive_mask(text: &[char]) -> Vec<bool> {
    let mut mask = vec![false; text.len()];

    for (i, c) in text.iter().enumerate() {
        if c.is_ascii_alphabetic() {
            mask[i] = true;
        } else {
            break;
        }
    }

    let class_start = text
        .windows(2)
        .rposition(|w| w == [':', ':'])
        .map(|p| p + 2)
        .unwrap_or(text.len());
    for flag in mask.iter_mut().skip(class_start) {
        *flag = true;
    }

    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_pattern() {
        assert!(matches_pattern(
            "USB0::0x1AB1::0x0517::XYZ::INSTR",
            "USB?*::INSTR"
        ));
        assert!(!matches_pattern("ASRL3::INSTR", "USB?*::INSTR"));
    }

    #[test]
    fn test_default_query() {
        assert!(matches_pattern("ASRL3::INSTR", DEFAULT_QUERY));
        assert!(matches_pattern("SIM::psu::INSTR", DEFAULT_QUERY));
        assert!(!matches_pattern("TCPIP0::10.0.0.2::5025::SOCKET", DEFAULT_QUERY));
        assert!(!matches_pattern("::INSTR", DEFAULT_QUERY));
    }

    #[test]
    fn test_question_mark_is_single_char() {
        assert!(matches_pattern("ASRL3::INSTR", "ASRL?::INSTR"));
        assert!(!matches_pattern("ASRL13::INSTR", "ASRL?::INSTR"));
        assert!(matches_pattern("ASRL13::INSTR", "ASRL??::INSTR"));
    }

    #[test]
    fn test_star_matches_empty() {
        assert!(matches_pattern("ASRL3::INSTR", "ASRL3*::INSTR"));
        assert!(matches_pattern("ASRL3::INSTR", "*"));
    }

    #[test]
    fn test_case_rules() {
        assert!(matches_pattern("usb0::0x1AB1::0x0517::XYZ::instr", "USB?*::INSTR"));
        assert!(matches_pattern("USB0::0x1AB1::0x0517::XYZ::INSTR", "usb?*::instr"));
        // Serial numbers are case-sensitive.
        assert!(!matches_pattern(
            "USB0::0x1AB1::0x0517::xyz::INSTR",
            "USB0::0x1AB1::0x0517::XYZ::INSTR"
        ));
    }

    #[test]
    fn test_literal_mismatch() {
        assert!(!matches_pattern("TCPIP0::10.0.0.2::INSTR", "TCPIP0::10.0.0.3::INSTR"));
        assert!(matches_pattern("TCPIP0::10.0.0.2::INSTR", "TCPIP?::10.0.0.*::INSTR"));
    }
}
