//! Scrub credentials out of backend error text and bound its length.
//!
//! Every `ProviderError` passes through [`Redactor::scrub`] when it is built,
//! so a classifier that forgets about secrets still cannot leak one.

const MAX_API_ERROR_CHARS: usize = 200;
pub const REDACTED: &str = "[REDACTED]";

/// Key prefixes handed out by the hosted backends (and a couple of common
/// bot tokens that show up in pasted configs).
const SECRET_PREFIXES: [&str; 5] = ["sk-ant-", "sk-", "AIza", "xoxb-", "xoxp-"];

/// Markers after which the rest of the token is a secret value.
const SECRET_MARKERS: [&str; 6] = [
    "key=",
    "api_key=",
    "apikey=",
    "access_token=",
    "Bearer ",
    "x-api-key: ",
];

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Replace `prefix<secret-chars>` runs. When `keep_prefix` is set the prefix
/// itself survives (`key=[REDACTED]`), otherwise the whole token goes.
fn scrub_after(input: &str, prefix: &str, keep_prefix: bool) -> String {
    let mut scrubbed = input.to_string();
    let mut search_from = 0;
    loop {
        let Some(rel) = scrubbed[search_from..].find(prefix) else {
            break;
        };

        let start = search_from + rel;
        let content_start = start + prefix.len();
        let end = token_end(&scrubbed, content_start);

        // Bare prefixes like "sk-" should not stop future scans, and a prefix
        // glued to a preceding word ("task-list") is not a key.
        let glued = !keep_prefix
            && scrubbed[..start]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        if end == content_start || glued {
            search_from = content_start;
            continue;
        }

        let replace_from = if keep_prefix { content_start } else { start };
        scrubbed.replace_range(replace_from..end, REDACTED);
        search_from = replace_from + REDACTED.len();
    }
    scrubbed
}

/// Scrub known secret-like token shapes from provider error strings.
pub fn scrub_secret_patterns(input: &str) -> String {
    let mut scrubbed = input.to_string();
    for prefix in SECRET_PREFIXES {
        scrubbed = scrub_after(&scrubbed, prefix, false);
    }
    for marker in SECRET_MARKERS {
        scrubbed = scrub_after(&scrubbed, marker, true);
    }
    scrubbed
}

/// Truncate to a loggable size on a char boundary.
pub fn truncate(input: &str) -> String {
    if input.chars().count() <= MAX_API_ERROR_CHARS {
        return input.to_string();
    }

    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &input[..end])
}

/// Credential-aware scrubber held by each provider.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secret: Option<String>,
}

impl Redactor {
    pub fn new(secret: Option<&str>) -> Self {
        let secret = secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);
        Self { secret }
    }

    /// Remove the configured credential (exact match) and anything shaped
    /// like a key.
    pub fn scrub(&self, input: &str) -> String {
        let exact = match &self.secret {
            Some(secret) => input.replace(secret.as_str(), REDACTED),
            None => input.to_string(),
        };
        scrub_secret_patterns(&exact)
    }

    /// Scrub, then truncate for use as an internal error message.
    pub fn sanitize(&self, input: &str) -> String {
        truncate(&self.scrub(input))
    }
}
