use super::response::Response;

/// ESMTP extensions advertised in an EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    keywords: Vec<String>,
}

impl Capabilities {
    /// Read the extension lines of an EHLO reply.
    ///
    /// The first line is the server's greeting and is skipped.
    #[must_use]
    pub fn from_ehlo(response: &Response) -> Self {
        Self {
            keywords: response
                .lines
                .iter()
                .skip(1)
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
        }
    }

    /// Whether the server advertised `keyword` (case-insensitive).
    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.keywords.iter().any(|line| {
            line.split([' ', '='])
                .next()
                .is_some_and(|first| first.eq_ignore_ascii_case(keyword))
        })
    }

    /// SASL mechanisms listed after `AUTH` (or the legacy `AUTH=`), upper-cased.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        self.keywords
            .iter()
            .filter_map(|line| {
                let upper = line.to_ascii_uppercase();
                upper
                    .strip_prefix("AUTH ")
                    .or_else(|| upper.strip_prefix("AUTH="))
                    .map(|rest| {
                        rest.split_whitespace()
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
            })
            .flatten()
            .collect()
    }
}
