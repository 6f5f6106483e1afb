/// Normalizes a display name into an identifier: lowercase ASCII
/// alphanumerics only.
///
/// `"Gen 9 OU"` and `"gen9ou"` map to the same id.
#[must_use]
pub fn to_id(text: &str) -> String {
    text.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
