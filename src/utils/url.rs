//! Endpoint construction for configured base URLs.

/// Strips trailing slashes from a base URL.
///
/// ```
/// use mcpchat::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://models.example.com/v1beta///"), "https://models.example.com/v1beta");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Joins a base URL and an endpoint path with exactly one slash.
///
/// ```
/// use mcpchat::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://models.example.com/v1beta/", "/models"),
///     "https://models.example.com/v1beta/models"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Streaming generation endpoint for `model`, with server-sent events.
///
/// A leading `models/` on the model name is accepted and not doubled.
pub fn stream_generate_url(base_url: &str, model: &str) -> String {
    let model = model.trim().trim_start_matches("models/");
    construct_api_url(
        base_url,
        &format!("models/{model}:streamGenerateContent?alt=sse"),
    )
}
