//! Company-name resolution.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::DossierError;

const MAX_NAME_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
    pub slug: String,
}

/// Turns the name a user typed into a known company.
pub trait CompanyResolver {
    fn resolve(&self, name: &str) -> Result<Company>;
}

/// Accepts any plausible name as-is, normalizing whitespace and deriving a slug.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameResolver;

impl CompanyResolver for NameResolver {
    fn resolve(&self, name: &str) -> Result<Company> {
        let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return Err(DossierError::CompanyResolution("company name is empty".into()).into());
        }
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(DossierError::CompanyResolution(format!(
                "company name is longer than {MAX_NAME_CHARS} characters"
            ))
            .into());
        }
        let slug = slugify(&name);
        if slug.is_empty() {
            return Err(
                DossierError::CompanyResolution(format!("`{name}` has no letters or digits")).into(),
            );
        }
        Ok(Company { name, slug })
    }
}

/// Lowercase alphanumerics separated by single hyphens.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
