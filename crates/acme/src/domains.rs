use std::collections::HashSet;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainGroupError {
    #[error("domain group must contain at least one domain")]
    Empty,
}

/// Last two dot-separated labels of `domain`.
///
/// Multi-label public suffixes such as `co.uk` are not recognised:
/// `shop.example.co.uk` maps to `co.uk`.
#[must_use]
pub fn registrable_domain(domain: &str) -> &str {
    let domain = domain.trim_end_matches('.');
    let mut dots = domain.rmatch_indices('.');
    match (dots.next(), dots.next()) {
        (Some(_), Some((index, _))) => &domain[index + 1..],
        _ => domain,
    }
}

/// Domains that share one certificate.
///
/// The first entry is the primary domain: it becomes the CSR common name
/// and names the key and bundle files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainGroup {
    domains: Vec<String>,
}

impl DomainGroup {
    /// Builds a group from `domains`, keeping their order.
    ///
    /// Names are trimmed, lowercased and stripped of a trailing dot. Blank
    /// entries and repeats are dropped.
    ///
    /// # Errors
    ///
    /// Returns `DomainGroupError::Empty` when no name remains.
    pub fn new<I, S>(domains: I) -> Result<Self, DomainGroupError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let domains: Vec<String> = domains
            .into_iter()
            .map(|raw| normalize_domain(raw.as_ref()))
            .filter(|domain| !domain.is_empty() && seen.insert(domain.clone()))
            .collect();
        if domains.is_empty() {
            return Err(DomainGroupError::Empty);
        }
        Ok(Self { domains })
    }

    #[must_use]
    pub fn primary(&self) -> &str {
        &self.domains[0]
    }

    #[must_use]
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Registrable domain of the primary entry.
    #[must_use]
    pub fn registrable_domain(&self) -> &str {
        registrable_domain(self.primary())
    }

    /// File-system name of the group: the primary domain with `*` replaced
    /// by `_`.
    #[must_use]
    pub fn file_stem(&self) -> String {
        self.primary().replace('*', "_")
    }
}

fn normalize_domain(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Groups domains by [`registrable_domain`].
///
/// Names are normalized as in [`DomainGroup::new`]. Groups appear in the
/// order their first member was seen and keep their members in input order.
#[must_use]
pub fn group_domains_by_registrable_domain<I, S>(domains: I) -> Vec<DomainGroup>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut buckets: Vec<(String, Vec<String>)> = Vec::new();

    for raw in domains {
        let domain = normalize_domain(raw.as_ref());
        let key = registrable_domain(&domain).to_owned();
        match buckets.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, members)) => members.push(domain),
            None => buckets.push((key, vec![domain])),
        }
    }

    buckets
        .into_iter()
        .filter_map(|(_, members)| DomainGroup::new(members).ok())
        .collect()
}
