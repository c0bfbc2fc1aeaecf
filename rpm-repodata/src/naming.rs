// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Published names of metadata files. */

use {
    crate::{
        error::{Result, RpmRepositoryError},
        io::{ChecksumType, ContentDigest},
    },
    serde::{Deserialize, Serialize},
    std::{path::Path, str::FromStr},
};

/// Derives the published filename of a metadata file.
///
/// Names must be derived from the final bytes of a file. For compressed metadata
/// that means after compression.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum NamingPolicy {
    /// The logical name is published as is.
    Plain,
    /// The logical name is prefixed with the hex digest of the file content.
    ///
    /// e.g. `<sha256>-primary.xml.gz`.
    Prefixed(ChecksumType),
}

impl NamingPolicy {
    /// Plain simple names.
    pub const PLAIN: Self = Self::Plain;
    /// SHA-1 prefixed names.
    pub const SHA1: Self = Self::Prefixed(ChecksumType::Sha1);
    /// SHA-256 prefixed names.
    pub const SHA256: Self = Self::Prefixed(ChecksumType::Sha256);

    /// Compute the published name of `content` whose logical name is `logical_name`.
    pub fn name(&self, logical_name: &str, content: impl AsRef<Path>) -> Result<String> {
        match self {
            Self::Plain => Ok(logical_name.to_string()),
            Self::Prefixed(checksum) => {
                let digest = ContentDigest::from_path(*checksum, content)?;

                Ok(format!("{}-{}", digest.digest_hex(), logical_name))
            }
        }
    }

    /// The configuration string of this policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Prefixed(ChecksumType::Sha1) => "sha1",
            Self::Prefixed(ChecksumType::Sha256) => "sha256",
        }
    }
}

impl Default for NamingPolicy {
    fn default() -> Self {
        Self::SHA256
    }
}

impl FromStr for NamingPolicy {
    type Err = RpmRepositoryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("plain") {
            Ok(Self::Plain)
        } else {
            ChecksumType::from_str(s)
                .map(Self::Prefixed)
                .map_err(|_| RpmRepositoryError::UnknownNamingPolicy(s.to_string()))
        }
    }
}

impl TryFrom<String> for NamingPolicy {
    type Error = RpmRepositoryError;

    fn try_from(v: String) -> std::result::Result<Self, Self::Error> {
        Self::from_str(&v)
    }
}

impl From<NamingPolicy> for String {
    fn from(v: NamingPolicy) -> Self {
        v.as_str().to_string()
    }
}
