//! URL builders for the engine session API.
//!
//! Ids are appended as single percent-encoded path segments, so an id holding
//! `/`, `?` or `#` cannot escape its place in the route.

use url::Url;

/// Parse an engine base URL, rejecting ones that cannot carry a path.
pub fn base(url: &str) -> Result<Url, String> {
    let parsed = Url::parse(url).map_err(|err| format!("invalid engine url {url}: {err}"))?;
    if parsed.cannot_be_a_base() {
        return Err(format!("invalid engine url {url}: not a base url"));
    }
    Ok(parsed)
}

fn join(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    // Only fails for cannot-be-a-base URLs, which `base()` rejects.
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

pub fn sessions(base: &Url) -> Url {
    join(base, &["api", "sessions"])
}

pub fn session(base: &Url, session_id: &str) -> Url {
    join(base, &["api", "sessions", session_id])
}

pub fn cells(base: &Url, session_id: &str) -> Url {
    join(base, &["api", "sessions", session_id, "cells"])
}

pub fn cell(base: &Url, session_id: &str, cell_id: &str) -> Url {
    join(base, &["api", "sessions", session_id, "cells", cell_id])
}

pub fn run_cell(base: &Url, session_id: &str, cell_id: &str) -> Url {
    join(base, &["api", "sessions", session_id, "cells", cell_id, "run"])
}

pub fn ephemeral(base: &Url, session_id: &str) -> Url {
    join(base, &["api", "sessions", session_id, "ephemeral"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_routes() {
        let base = base("http://localhost:1234/").unwrap();
        assert_eq!(sessions(&base).as_str(), "http://localhost:1234/api/sessions");
        assert_eq!(
            run_cell(&base, "s1", "c1").as_str(),
            "http://localhost:1234/api/sessions/s1/cells/c1/run"
        );
        assert_eq!(
            ephemeral(&base, "s1").as_str(),
            "http://localhost:1234/api/sessions/s1/ephemeral"
        );
        assert_eq!(
            cells(&base, "s1").as_str(),
            "http://localhost:1234/api/sessions/s1/cells"
        );
    }

    #[test]
    fn ids_stay_inside_their_segment() {
        let base = base("http://localhost:1234").unwrap();
        let url = run_cell(&base, "s/1", "a/b?x#y");
        assert_eq!(
            url.as_str(),
            "http://localhost:1234/api/sessions/s%2F1/cells/a%2Fb%3Fx%23y/run"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn keeps_a_base_path_prefix() {
        let base = base("http://proxy.internal/engine/").unwrap();
        assert_eq!(
            session(&base, "s1").as_str(),
            "http://proxy.internal/engine/api/sessions/s1"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(base("not a url").is_err());
        assert!(base("mailto:engine@example.com").is_err());
    }
}
