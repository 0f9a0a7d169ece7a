/// Splits a single CSV-style line into fields, honouring a single-character
/// quote (spec §2 "CSV line decoder"). A field is only treated as quoted if
/// its *first* character is the quote character; quote characters appearing
/// anywhere else in a field are passed through verbatim, i.e. decoding never
/// strips quotes from text that wasn't actually quoted.
pub fn decode_line(line: &str, separator: char, quote: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        if in_quotes {
            if c == quote {
                in_quotes = false;
            } else {
                current.push(c);
            }
        } else if c == quote && current.is_empty() {
            in_quotes = true;
        } else if c == separator {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);

    fields
}
