//! Double Metaphone phonetic encoding.
//!
//! Produces a primary and an alternate code for a single word. Input is
//! expected to be already stripped of diacritics; it is trimmed and uppercased
//! here. Characters outside the handled set are skipped.

/// The primary and alternate codes of a word.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Codes {
    pub primary: String,
    pub alternate: String,
}

/// Double Metaphone encoder with a fixed maximum code length.
#[derive(Debug, Clone, Copy)]
pub struct DoubleMetaphone {
    max_len: usize,
}

impl Default for DoubleMetaphone {
    fn default() -> Self {
        Self { max_len: 4 }
    }
}

const VOWELS: &str = "AEIOUY";

impl DoubleMetaphone {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Encodes `word`, returning empty codes for blank input.
    pub fn encode(&self, word: &str) -> Codes {
        let chars = word.trim().to_uppercase().chars().collect::<Vec<_>>();
        if chars.is_empty() {
            return Codes::default();
        }
        let mut run = Encoding {
            value: &chars,
            slavo_germanic: false,
            out: Output { primary: String::new(), alternate: String::new(), max_len: self.max_len },
        };
        run.slavo_germanic = run.contains_anywhere(&["W", "K", "CZ", "WITZ"]);
        run.encode();
        Codes { primary: run.out.primary, alternate: run.out.alternate }
    }

    /// Convenience for the primary code.
    pub fn primary(&self, word: &str) -> String {
        self.encode(word).primary
    }
}

struct Output {
    primary: String,
    alternate: String,
    max_len: usize,
}

impl Output {
    fn push_primary(&mut self, code: &str) {
        push_bounded(&mut self.primary, code, self.max_len);
    }

    fn push_alternate(&mut self, code: &str) {
        push_bounded(&mut self.alternate, code, self.max_len);
    }

    fn push(&mut self, code: &str) {
        self.push_primary(code);
        self.push_alternate(code);
    }

    fn push_both(&mut self, primary: &str, alternate: &str) {
        self.push_primary(primary);
        self.push_alternate(alternate);
    }

    fn is_complete(&self) -> bool {
        self.primary.chars().count() >= self.max_len && self.alternate.chars().count() >= self.max_len
    }
}

fn push_bounded(target: &mut String, code: &str, max_len: usize) {
    let room = max_len.saturating_sub(target.chars().count());
    target.extend(code.chars().take(room));
}

struct Encoding<'a> {
    value: &'a [char],
    slavo_germanic: bool,
    out: Output,
}

impl Encoding<'_> {
    fn len(&self) -> isize {
        self.value.len() as isize
    }

    fn at(&self, index: isize) -> char {
        if index < 0 || index >= self.len() {
            '\0'
        } else {
            self.value[index as usize]
        }
    }

    fn is_vowel(&self, index: isize) -> bool {
        let c = self.at(index);
        c != '\0' && VOWELS.contains(c)
    }

    /// Whether the `length` characters at `start` equal one of `options`.
    fn contains(&self, start: isize, length: isize, options: &[&str]) -> bool {
        if start < 0 || start + length > self.len() {
            return false;
        }
        let window = &self.value[start as usize..(start + length) as usize];
        options
            .iter()
            .any(|option| option.chars().eq(window.iter().copied()))
    }

    fn contains_anywhere(&self, needles: &[&str]) -> bool {
        let text = self.value.iter().collect::<String>();
        needles.iter().any(|needle| text.contains(needle))
    }

    fn encode(&mut self) {
        let mut index: isize =
            if self.contains(0, 2, &["GN", "KN", "PN", "WR", "PS"]) { 1 } else { 0 };
        while !self.out.is_complete() && index < self.len() {
            index = match self.at(index) {
                'A' | 'E' | 'I' | 'O' | 'U' | 'Y' => {
                    if index == 0 {
                        self.out.push("A");
                    }
                    index + 1
                }
                'B' => self.simple("P", 'B', index),
                'Ç' => {
                    self.out.push("S");
                    index + 1
                }
                'C' => self.c(index),
                'D' => self.d(index),
                'F' => self.simple("F", 'F', index),
                'G' => self.g(index),
                'H' => self.h(index),
                'J' => self.j(index),
                'K' => self.simple("K", 'K', index),
                'L' => self.l(index),
                'M' => {
                    self.out.push("M");
                    if self.m_doubles(index) { index + 2 } else { index + 1 }
                }
                'N' => self.simple("N", 'N', index),
                'Ñ' => {
                    self.out.push("N");
                    index + 1
                }
                'P' => self.p(index),
                'Q' => self.simple("K", 'Q', index),
                'R' => self.r(index),
                'S' => self.s(index),
                'T' => self.t(index),
                'V' => self.simple("F", 'V', index),
                'W' => self.w(index),
                'X' => self.x(index),
                'Z' => self.z(index),
                _ => index + 1,
            };
        }
    }

    fn simple(&mut self, code: &str, letter: char, index: isize) -> isize {
        self.out.push(code);
        if self.at(index + 1) == letter { index + 2 } else { index + 1 }
    }

    fn c(&mut self, index: isize) -> isize {
        if self.c_is_hard_germanic(index) {
            self.out.push("K");
            index + 2
        } else if index == 0 && self.contains(index, 6, &["CAESAR"]) {
            self.out.push("S");
            index + 2
        } else if self.contains(index, 2, &["CH"]) {
            self.ch(index)
        } else if self.contains(index, 2, &["CZ"]) && !self.contains(index - 2, 4, &["WICZ"]) {
            self.out.push_both("S", "X");
            index + 2
        } else if self.contains(index + 1, 3, &["CIA"]) {
            self.out.push("X");
            index + 3
        } else if self.contains(index, 2, &["CC"]) && !(index == 1 && self.at(0) == 'M') {
            self.cc(index)
        } else if self.contains(index, 2, &["CK", "CG", "CQ"]) {
            self.out.push("K");
            index + 2
        } else if self.contains(index, 2, &["CI", "CE", "CY"]) {
            if self.contains(index, 3, &["CIO", "CIE", "CIA"]) {
                self.out.push_both("S", "X");
            } else {
                self.out.push("S");
            }
            index + 2
        } else {
            self.out.push("K");
            if self.contains(index + 1, 2, &[" C", " Q", " G"]) {
                index + 3
            } else if self.contains(index + 1, 1, &["C", "K", "Q"])
                && !self.contains(index + 1, 2, &["CE", "CI"])
            {
                index + 2
            } else {
                index + 1
            }
        }
    }

    fn c_is_hard_germanic(&self, index: isize) -> bool {
        if self.contains(index, 4, &["CHIA"]) {
            return true;
        }
        if index <= 1 || self.is_vowel(index - 2) || !self.contains(index - 1, 3, &["ACH"]) {
            return false;
        }
        let next = self.at(index + 2);
        (next != 'I' && next != 'E') || self.contains(index - 2, 6, &["BACHER", "MACHER"])
    }

    fn cc(&mut self, index: isize) -> isize {
        if self.contains(index + 2, 1, &["I", "E", "H"]) && !self.contains(index + 2, 2, &["HU"]) {
            if (index == 1 && self.at(index - 1) == 'A')
                || self.contains(index - 1, 5, &["UCCEE", "UCCES"])
            {
                self.out.push("KS");
            } else {
                self.out.push("X");
            }
            index + 3
        } else {
            self.out.push("K");
            index + 2
        }
    }

    fn ch(&mut self, index: isize) -> isize {
        if index > 0 && self.contains(index, 4, &["CHAE"]) {
            self.out.push_both("K", "X");
        } else if self.ch_is_greek(index) || self.ch_is_hard(index) {
            self.out.push("K");
        } else if index > 0 {
            if self.contains(0, 2, &["MC"]) {
                self.out.push("K");
            } else {
                self.out.push_both("X", "K");
            }
        } else {
            self.out.push("X");
        }
        index + 2
    }

    fn ch_is_greek(&self, index: isize) -> bool {
        index == 0
            && (self.contains(index + 1, 5, &["HARAC", "HARIS"])
                || self.contains(index + 1, 3, &["HOR", "HYM", "HIA", "HEM"]))
            && !self.contains(0, 5, &["CHORE"])
    }

    fn ch_is_hard(&self, index: isize) -> bool {
        self.contains(0, 4, &["VAN ", "VON "])
            || self.contains(0, 3, &["SCH"])
            || self.contains(index - 2, 6, &["ORCHES", "ARCHIT", "ORCHID"])
            || self.contains(index + 2, 1, &["T", "S"])
            || ((self.contains(index - 1, 1, &["A", "O", "U", "E"]) || index == 0)
                && (self.contains(index + 2, 1, &["L", "R", "N", "M", "B", "H", "F", "V", "W", " "])
                    || index + 1 == self.len() - 1))
    }

    fn d(&mut self, index: isize) -> isize {
        if self.contains(index, 2, &["DG"]) {
            if self.contains(index + 2, 1, &["I", "E", "Y"]) {
                self.out.push("J");
                index + 3
            } else {
                self.out.push("TK");
                index + 2
            }
        } else if self.contains(index, 2, &["DT", "DD"]) {
            self.out.push("T");
            index + 2
        } else {
            self.out.push("T");
            index + 1
        }
    }

    fn g(&mut self, index: isize) -> isize {
        let next = self.at(index + 1);
        if next == 'H' {
            return self.gh(index);
        }
        if next == 'N' {
            if index == 1 && self.is_vowel(0) && !self.slavo_germanic {
                self.out.push_both("KN", "N");
            } else if !self.contains(index + 2, 2, &["EY"]) && next != 'Y' && !self.slavo_germanic {
                self.out.push_both("N", "KN");
            } else {
                self.out.push("KN");
            }
            return index + 2;
        }
        if self.contains(index + 1, 2, &["LI"]) && !self.slavo_germanic {
            self.out.push_both("KL", "L");
            return index + 2;
        }
        if index == 0
            && (next == 'Y'
                || self.contains(
                    index + 1,
                    2,
                    &["ES", "EP", "EB", "EL", "EY", "IB", "IL", "IN", "IE", "EI", "ER"],
                ))
        {
            self.out.push_both("K", "J");
            return index + 2;
        }
        if (self.contains(index + 1, 2, &["ER"]) || next == 'Y')
            && !self.contains(0, 6, &["DANGER", "RANGER", "MANGER"])
            && !self.contains(index - 1, 1, &["E", "I"])
            && !self.contains(index - 1, 3, &["RGY", "OGY"])
        {
            self.out.push_both("K", "J");
            return index + 2;
        }
        if self.contains(index + 1, 1, &["E", "I", "Y"]) || self.contains(index - 1, 4, &["AGGI", "OGGI"]) {
            if self.contains(0, 4, &["VAN ", "VON "])
                || self.contains(0, 3, &["SCH"])
                || self.contains(index + 1, 2, &["ET"])
            {
                self.out.push("K");
            } else if self.contains(index + 1, 3, &["IER"]) {
                self.out.push("J");
            } else {
                self.out.push_both("J", "K");
            }
            return index + 2;
        }
        self.out.push("K");
        if next == 'G' { index + 2 } else { index + 1 }
    }

    fn gh(&mut self, index: isize) -> isize {
        if index > 0 && !self.is_vowel(index - 1) {
            self.out.push("K");
        } else if index == 0 {
            if self.at(index + 2) == 'I' {
                self.out.push("J");
            } else {
                self.out.push("K");
            }
        } else if (index > 1 && self.contains(index - 2, 1, &["B", "H", "D"]))
            || (index > 2 && self.contains(index - 3, 1, &["B", "H", "D"]))
            || (index > 3 && self.contains(index - 4, 1, &["B", "H"]))
        {
            // silent, as in "hugh"
        } else if index > 2
            && self.at(index - 1) == 'U'
            && self.contains(index - 3, 1, &["C", "G", "L", "R", "T"])
        {
            self.out.push("F");
        } else if index > 0 && self.at(index - 1) != 'I' {
            self.out.push("K");
        }
        index + 2
    }

    fn h(&mut self, index: isize) -> isize {
        if (index == 0 || self.is_vowel(index - 1)) && self.is_vowel(index + 1) {
            self.out.push("H");
            index + 2
        } else {
            index + 1
        }
    }

    fn j(&mut self, index: isize) -> isize {
        if self.contains(index, 4, &["JOSE"]) || self.contains(0, 4, &["SAN "]) {
            if (index == 0 && self.at(index + 4) == ' ')
                || self.len() == 4
                || self.contains(0, 4, &["SAN "])
            {
                self.out.push("H");
            } else {
                self.out.push_both("J", "H");
            }
            return index + 1;
        }
        if index == 0 {
            self.out.push_both("J", "A");
        } else if self.is_vowel(index - 1)
            && !self.slavo_germanic
            && matches!(self.at(index + 1), 'A' | 'O')
        {
            self.out.push_both("J", "H");
        } else if index == self.len() - 1 {
            self.out.push_both("J", " ");
        } else if !self.contains(index + 1, 1, &["L", "T", "K", "S", "N", "M", "B", "Z"])
            && !self.contains(index - 1, 1, &["S", "K", "L"])
        {
            self.out.push("J");
        }
        if self.at(index + 1) == 'J' { index + 2 } else { index + 1 }
    }

    fn l(&mut self, index: isize) -> isize {
        if self.at(index + 1) != 'L' {
            self.out.push("L");
            return index + 1;
        }
        if self.ll_is_spanish(index) {
            self.out.push_primary("L");
        } else {
            self.out.push("L");
        }
        index + 2
    }

    fn ll_is_spanish(&self, index: isize) -> bool {
        let len = self.len();
        (index == len - 3 && self.contains(index - 1, 4, &["ILLO", "ILLA", "ALLE"]))
            || ((self.contains(len - 2, 2, &["AS", "OS"]) || self.contains(len - 1, 1, &["A", "O"]))
                && self.contains(index - 1, 4, &["ALLE"]))
    }

    fn m_doubles(&self, index: isize) -> bool {
        self.at(index + 1) == 'M'
            || (self.contains(index - 1, 3, &["UMB"])
                && (index + 1 == self.len() - 1 || self.contains(index + 2, 2, &["ER"])))
    }

    fn p(&mut self, index: isize) -> isize {
        if self.at(index + 1) == 'H' {
            self.out.push("F");
            return index + 2;
        }
        self.out.push("P");
        if self.contains(index + 1, 1, &["P", "B"]) { index + 2 } else { index + 1 }
    }

    fn r(&mut self, index: isize) -> isize {
        if index == self.len() - 1
            && !self.slavo_germanic
            && self.contains(index - 2, 2, &["IE"])
            && !self.contains(index - 4, 2, &["ME", "MA"])
        {
            self.out.push_alternate("R");
        } else {
            self.out.push("R");
        }
        if self.at(index + 1) == 'R' { index + 2 } else { index + 1 }
    }

    fn s(&mut self, index: isize) -> isize {
        if self.contains(index - 1, 3, &["ISL", "YSL"]) {
            return index + 1;
        }
        if index == 0 && self.contains(index, 5, &["SUGAR"]) {
            self.out.push_both("X", "S");
            return index + 1;
        }
        if self.contains(index, 2, &["SH"]) {
            if self.contains(index + 1, 4, &["HEIM", "HOEK", "HOLM", "HOLZ"]) {
                self.out.push("S");
            } else {
                self.out.push("X");
            }
            return index + 2;
        }
        if self.contains(index, 3, &["SIO", "SIA"]) || self.contains(index, 4, &["SIAN"]) {
            if self.slavo_germanic {
                self.out.push("S");
            } else {
                self.out.push_both("S", "X");
            }
            return index + 3;
        }
        if (index == 0 && self.contains(index + 1, 1, &["M", "N", "L", "W"]))
            || self.contains(index + 1, 1, &["Z"])
        {
            self.out.push_both("S", "X");
            return if self.contains(index + 1, 1, &["Z"]) { index + 2 } else { index + 1 };
        }
        if self.contains(index, 2, &["SC"]) {
            return self.sc(index);
        }
        if index == self.len() - 1 && self.contains(index - 2, 2, &["AI", "OI"]) {
            self.out.push_alternate("S");
        } else {
            self.out.push("S");
        }
        if self.contains(index + 1, 1, &["S", "Z"]) { index + 2 } else { index + 1 }
    }

    fn sc(&mut self, index: isize) -> isize {
        if self.at(index + 2) == 'H' {
            if self.contains(index + 3, 2, &["OO", "ER", "EN", "UY", "ED", "EM"]) {
                if self.contains(index + 3, 2, &["ER", "EN"]) {
                    self.out.push_both("X", "SK");
                } else {
                    self.out.push("SK");
                }
            } else if index == 0 && !self.is_vowel(3) && self.at(3) != 'W' {
                self.out.push_both("X", "S");
            } else {
                self.out.push("X");
            }
        } else if self.contains(index + 2, 1, &["I", "E", "Y"]) {
            self.out.push("S");
        } else {
            self.out.push("SK");
        }
        index + 3
    }

    fn t(&mut self, index: isize) -> isize {
        if self.contains(index, 4, &["TION"]) || self.contains(index, 3, &["TIA", "TCH"]) {
            self.out.push("X");
            return index + 3;
        }
        if self.contains(index, 2, &["TH"]) || self.contains(index, 3, &["TTH"]) {
            if self.contains(index + 2, 2, &["OM", "AM"])
                || self.contains(0, 4, &["VAN ", "VON "])
                || self.contains(0, 3, &["SCH"])
            {
                self.out.push("T");
            } else {
                self.out.push_both("0", "T");
            }
            return index + 2;
        }
        self.out.push("T");
        if self.contains(index + 1, 1, &["T", "D"]) { index + 2 } else { index + 1 }
    }

    fn w(&mut self, index: isize) -> isize {
        if self.contains(index, 2, &["WR"]) {
            self.out.push("R");
            return index + 2;
        }
        if index == 0 && (self.is_vowel(index + 1) || self.contains(index, 2, &["WH"])) {
            if self.is_vowel(index + 1) {
                self.out.push_both("A", "F");
            } else {
                self.out.push("A");
            }
            return index + 1;
        }
        if (index == self.len() - 1 && self.is_vowel(index - 1))
            || self.contains(index - 1, 5, &["EWSKI", "EWSKY", "OWSKI", "OWSKY"])
            || self.contains(0, 3, &["SCH"])
        {
            self.out.push_alternate("F");
            return index + 1;
        }
        if self.contains(index, 4, &["WICZ", "WITZ"]) {
            self.out.push_both("TS", "FX");
            return index + 4;
        }
        index + 1
    }

    fn x(&mut self, index: isize) -> isize {
        if index == 0 {
            self.out.push("S");
            return index + 1;
        }
        let silent_french = index == self.len() - 1
            && (self.contains(index - 3, 3, &["IAU", "EAU"]) || self.contains(index - 2, 2, &["AU", "OU"]));
        if !silent_french {
            self.out.push("KS");
        }
        if self.contains(index + 1, 1, &["C", "X"]) { index + 2 } else { index + 1 }
    }

    fn z(&mut self, index: isize) -> isize {
        if self.at(index + 1) == 'H' {
            self.out.push("J");
            return index + 2;
        }
        if self.contains(index + 1, 2, &["ZO", "ZI", "ZA"])
            || (self.slavo_germanic && index > 0 && self.at(index - 1) != 'T')
        {
            self.out.push_both("S", "TS");
        } else {
            self.out.push("S");
        }
        if self.at(index + 1) == 'Z' { index + 2 } else { index + 1 }
    }
}
