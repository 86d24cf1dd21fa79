//! Tab-delimited request parsing and stub responses.
//!
//! Real backends answer these requests from a package database; this stub
//! answers with canned data so the daemon side can be exercised without one.

/// One decoded backend request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SearchName { filter: String, text: String },
    RefreshCache { force: bool },
    Unsupported { verb: String },
}

impl Request {
    /// Decode a request from its fields: the verb followed by its
    /// arguments. Used both for the argv form and for stdin lines.
    pub fn from_fields(fields: &[String]) -> Self {
        let verb = fields.first().map(String::as_str).unwrap_or_default();
        match verb {
            "search-name" => Request::SearchName {
                filter: fields.get(1).cloned().unwrap_or_default(),
                text: fields.get(2).cloned().unwrap_or_default(),
            },
            "refresh-cache" => Request::RefreshCache {
                force: matches!(
                    fields.get(1).map(String::as_str),
                    Some("true") | Some("yes") | Some("1")
                ),
            },
            _ => Request::Unsupported {
                verb: verb.to_string(),
            },
        }
    }

    /// Decode one stdin request line (fields separated by tabs).
    pub fn from_line(line: &str) -> Self {
        let fields: Vec<String> = line.split('\t').map(str::to_string).collect();
        Self::from_fields(&fields)
    }

    /// Produce the stub response, one wire line per element. Every request
    /// ends with a `finished` line.
    pub fn respond(&self) -> Vec<String> {
        let mut lines = match self {
            Request::SearchName { filter, text } => vec![format!(
                "package\tavailable\t{};0.0.1;noarch;stub\tStub package matching '{}' ({})",
                text.replace(char::is_whitespace, "-").to_lowercase(),
                text,
                filter,
            )],
            Request::RefreshCache { force } => {
                tracing::debug!(force, "refreshing stub cache");
                Vec::new()
            }
            Request::Unsupported { verb } => {
                vec![format!("error\tunsupported-request\t{verb}")]
            }
        };
        lines.push("finished".to_string());
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn test_parse_search_name() {
        let request = Request::from_fields(&fields(&["search-name", "none", "power manager"]));
        assert_eq!(
            request,
            Request::SearchName {
                filter: "none".into(),
                text: "power manager".into(),
            }
        );
    }

    #[test]
    fn test_parse_from_tab_delimited_line() {
        let request = Request::from_line("search-name\tnone\tpower manager");
        assert_eq!(
            request,
            Request::SearchName {
                filter: "none".into(),
                text: "power manager".into(),
            }
        );
    }

    #[test]
    fn test_parse_refresh_cache_force_spellings() {
        for force in ["true", "yes", "1"] {
            let request = Request::from_line(&format!("refresh-cache\t{force}"));
            assert_eq!(request, Request::RefreshCache { force: true });
        }
        let request = Request::from_line("refresh-cache\tfalse");
        assert_eq!(request, Request::RefreshCache { force: false });
    }

    #[test]
    fn test_parse_unknown_verb() {
        let request = Request::from_line("install-packages\tpkg;1;x86_64;repo");
        assert_eq!(
            request,
            Request::Unsupported {
                verb: "install-packages".into(),
            }
        );
    }

    #[test]
    fn test_parse_empty_line() {
        assert_eq!(Request::from_line(""), Request::Unsupported { verb: String::new() });
    }

    #[test]
    fn test_search_response_shape() {
        let request = Request::from_line("search-name\tnone\tpower manager");
        let lines = request.respond();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("package\tavailable\tpower-manager;"));
        assert!(lines[0].contains("power manager"));
        assert_eq!(lines[1], "finished");
    }

    #[test]
    fn test_every_response_ends_with_finished() {
        for line in ["search-name\tnone\tfoo", "refresh-cache\ttrue", "bogus"] {
            let lines = Request::from_line(line).respond();
            assert_eq!(lines.last().map(String::as_str), Some("finished"));
        }
    }

    #[test]
    fn test_unsupported_response_names_the_verb() {
        let lines = Request::from_line("what-provides\tcodec").respond();
        assert_eq!(lines[0], "error\tunsupported-request\twhat-provides");
    }
}
