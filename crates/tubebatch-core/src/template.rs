//! Output filename templates.
//!
//! User templates use `{token}` placeholders; the backend expects `%(token)s`
//! form. Only the documented tokens are translated, anything else is left
//! as literal text. Stray filesystem-hostile characters are stripped.

/// Tokens the user template may reference.
const TOKENS: &[(&str, &str)] = &[
    ("{title}", "%(title)s"),
    ("{uploader}", "%(uploader)s"),
    ("{upload_date}", "%(upload_date)s"),
    ("{date}", "%(upload_date)s"),
    ("{id}", "%(id)s"),
    ("{resolution}", "%(resolution)s"),
    ("{ext}", "%(ext)s"),
    // Longest first: "{playlist_index}" must not be eaten by "{playlist}".
    ("{playlist_index}", "%(playlist_index)s"),
    ("{playlist}", "%(playlist)s"),
];

/// Translate a user template into the backend's form, appending the
/// extension placeholder when the template does not already carry one.
#[must_use]
pub fn to_backend_template(user_template: &str) -> String {
    let mut template = sanitize_template(user_template);
    for (token, replacement) in TOKENS {
        template = template.replace(token, replacement);
    }
    if !template.contains("%(ext)s") {
        template.push_str(".%(ext)s");
    }
    template
}

/// Strip characters that are not valid in filenames on common filesystems.
#[must_use]
pub fn sanitize_template(template: &str) -> String {
    template
        .chars()
        .filter(|&c| {
            !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control()
        })
        .collect()
}
