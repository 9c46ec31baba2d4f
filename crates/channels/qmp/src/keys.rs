//! Key names and text-to-keystroke mapping for `send-key`.
//!
//! QEMU names keys by US-layout qcode; characters that need shift are sent as
//! a chord of `shift` plus the unshifted key.

/// One `send-key` invocation: all keys go down together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyChord {
    pub shift: bool,
    pub key: &'static str,
}

impl KeyChord {
    pub fn qcodes(&self) -> Vec<&'static str> {
        if self.shift {
            vec!["shift", self.key]
        } else {
            vec![self.key]
        }
    }
}

impl std::fmt::Display for KeyChord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.shift {
            write!(f, "shift+{}", self.key)
        } else {
            f.write_str(self.key)
        }
    }
}

const LETTERS: [&str; 26] = [
    "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n", "o", "p", "q", "r", "s",
    "t", "u", "v", "w", "x", "y", "z",
];
const DIGITS: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

/// Map a friendlier key name onto its qcode; qcodes pass through unchanged.
pub fn qcode(name: &str) -> &str {
    match name {
        "space" => "spc",
        "enter" | "return" => "ret",
        "escape" => "esc",
        "control" => "ctrl",
        "del" => "delete",
        other => other,
    }
}

pub fn chord_for(c: char) -> Option<KeyChord> {
    let plain = |key| KeyChord { shift: false, key };
    let shifted = |key| KeyChord { shift: true, key };

    let chord = match c {
        'a'..='z' => plain(LETTERS[c as usize - 'a' as usize]),
        'A'..='Z' => shifted(LETTERS[c as usize - 'A' as usize]),
        '0'..='9' => plain(DIGITS[c as usize - '0' as usize]),
        ' ' => plain("spc"),
        '\n' => plain("ret"),
        '\t' => plain("tab"),
        '-' => plain("minus"),
        '=' => plain("equal"),
        '[' => plain("bracket_left"),
        ']' => plain("bracket_right"),
        ';' => plain("semicolon"),
        '\'' => plain("apostrophe"),
        '`' => plain("grave_accent"),
        '\\' => plain("backslash"),
        ',' => plain("comma"),
        '.' => plain("dot"),
        '/' => plain("slash"),
        '!' => shifted("1"),
        '@' => shifted("2"),
        '#' => shifted("3"),
        '$' => shifted("4"),
        '%' => shifted("5"),
        '^' => shifted("6"),
        '&' => shifted("7"),
        '*' => shifted("8"),
        '(' => shifted("9"),
        ')' => shifted("0"),
        '_' => shifted("minus"),
        '+' => shifted("equal"),
        '{' => shifted("bracket_left"),
        '}' => shifted("bracket_right"),
        ':' => shifted("semicolon"),
        '"' => shifted("apostrophe"),
        '~' => shifted("grave_accent"),
        '|' => shifted("backslash"),
        '<' => shifted("comma"),
        '>' => shifted("dot"),
        '?' => shifted("slash"),
        _ => return None,
    };
    Some(chord)
}

/// Chords for `text`, or the first character that has no key.
pub fn text_to_chords(text: &str) -> Result<Vec<KeyChord>, char> {
    text.chars().map(|c| chord_for(c).ok_or(c)).collect()
}
