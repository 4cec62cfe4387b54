//! Subject fingerprints: the cache key for a discovery result.
//!
//! A fingerprint is `<class>-<sha256 hex>` over a canonical JSON rendering of
//! the subject's identity-relevant fields.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ProspectorError;
use crate::model::{LiveAddress, Subject, SubjectClass};
use crate::template::TemplateMetadata;

/// Deterministic digest identifying a discovery subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Subject class encoded in the prefix.
    pub fn class(&self) -> Option<SubjectClass> {
        self.0
            .split_once('-')
            .and_then(|(class, _)| SubjectClass::parse(class))
    }

    /// Parse a fingerprint previously rendered with `Display`.
    pub fn parse(value: &str) -> crate::Result<Self> {
        let invalid = || ProspectorError::InvalidFingerprint(value.to_string());
        let (class, digest) = value.split_once('-').ok_or_else(invalid)?;
        if SubjectClass::parse(class).is_none() {
            return Err(invalid());
        }
        if digest.len() != 64 || !digest.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(invalid());
        }
        Ok(Fingerprint(value.to_string()))
    }

    fn from_parts(class: SubjectClass, canonical: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical);
        Fingerprint(format!("{}-{:x}", class.as_str(), hasher.finalize()))
    }

    #[cfg(test)]
    pub(crate) fn for_test(class: &str) -> Self {
        Fingerprint(format!("{class}-{}", "0".repeat(64)))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Identity<'a> {
    Template {
        id: &'a str,
        config: BTreeMap<&'a str, &'a str>,
    },
    Image {
        image: &'a str,
        args: &'a [String],
        env: &'a BTreeMap<String, String>,
        port: u16,
    },
    Http {
        url: &'a str,
    },
    Stdio {
        label: &'a str,
    },
}

/// Compute the fingerprint of `subject`.
///
/// For template subjects, `template` supplies the declared config schema:
/// undeclared keys and keys marked secret are left out of the digest. When
/// the template declares no properties (or could not be loaded) every key
/// counts.
pub fn fingerprint(subject: &Subject, template: Option<&TemplateMetadata>) -> Fingerprint {
    let identity = match subject {
        Subject::Template(t) => Identity::Template {
            id: &t.template_id,
            config: t
                .config
                .iter()
                .filter(|(key, _)| is_identity_key(template, key))
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
        },
        Subject::Image(i) => Identity::Image {
            image: &i.image,
            args: &i.args,
            env: &i.env,
            port: i.port,
        },
        Subject::Running(LiveAddress::Http { base_url }) => Identity::Http {
            url: base_url.trim_end_matches('/'),
        },
        Subject::Running(LiveAddress::Stdio(handle)) => Identity::Stdio {
            label: handle.label(),
        },
    };
    // BTreeMap keys and fixed field order make the rendering canonical
    let canonical = serde_json::to_vec(&identity).unwrap_or_default();
    Fingerprint::from_parts(subject.class(), &canonical)
}

fn is_identity_key(template: Option<&TemplateMetadata>, key: &str) -> bool {
    let Some(properties) = template
        .and_then(|t| t.config_schema.as_ref())
        .map(|schema| &schema.properties)
        .filter(|properties| !properties.is_empty())
    else {
        return true;
    };
    properties.get(key).is_some_and(|property| !property.is_secret())
}
