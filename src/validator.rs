// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The validator framework (§4.3.3): namespace-dispatched record validation
//! and selection among competing values for the same key.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// A capability that checks whether a value is acceptable for a given key,
/// and picks the better of two competing values for the same key.
///
/// `select` must be deterministic: given the same `values`, the same index
/// is returned regardless of call order, since it is used both to decide
/// whether an inbound write should overwrite a locally held record and to
/// pick a winner among the responses gathered by a `GET_VALUE` lookup.
pub trait Validator: Send + Sync {
    /// Stateless, byte-level check that `value` is well-formed for `key`.
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), ValidationError>;

    /// Index into `values` of the value that should win. `values` is never
    /// empty when this is called.
    fn select(&self, key: &[u8], values: &[&[u8]]) -> usize;
}

/// The built-in `/pk/` namespace validator: the key must be
/// `/pk/<sha256(value)>` and any value matching that digest is accepted.
/// Among competing values there is at most one that can satisfy the
/// binding, so `select` always picks the first (only) valid one it sees —
/// callers are expected to have already filtered to validator-accepted
/// values before calling `select`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublicKeyValidator;

impl Validator for PublicKeyValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), ValidationError> {
        let Some(digest_part) = key.strip_prefix(b"/pk/") else {
            return Err(ValidationError::Malformed);
        };
        let digest = Sha256::digest(value);
        if digest_part == digest.as_slice() {
            Ok(())
        } else {
            Err(ValidationError::Malformed)
        }
    }

    fn select(&self, _key: &[u8], _values: &[&[u8]]) -> usize {
        0
    }
}

/// An immutable-after-construction registry mapping a `/<namespace>/`
/// prefix to the [`Validator`] that governs it. Unknown namespaces are a
/// hard `Err`; there are no implicit fallbacks (§4.3.3).
pub struct ValidatorRegistry {
    validators: HashMap<Vec<u8>, Box<dyn Validator>>,
}

impl ValidatorRegistry {
    /// A registry with only the mandatory built-in `pk` validator.
    pub fn new() -> Self {
        let mut validators: HashMap<Vec<u8>, Box<dyn Validator>> = HashMap::new();
        validators.insert(b"pk".to_vec(), Box::new(PublicKeyValidator));
        Self { validators }
    }

    /// Register an additional validator for `namespace` (without leading or
    /// trailing slashes, e.g. `"ipns"`). Intended to be called during
    /// construction, before the registry is shared with the rest of the
    /// crate; there is no removal API.
    pub fn register(&mut self, namespace: impl Into<Vec<u8>>, validator: Box<dyn Validator>) {
        self.validators.insert(namespace.into(), validator);
    }

    /// The namespace segment of `key`, i.e. the bytes between the first and
    /// second `/`. Returns `None` for keys with no leading `/namespace/`.
    pub fn namespace_of(key: &[u8]) -> Option<&[u8]> {
        if key.first() != Some(&b'/') {
            return None;
        }
        let rest = &key[1..];
        let end = rest.iter().position(|b| *b == b'/')?;
        Some(&rest[..end])
    }

    fn validator_for(&self, key: &[u8]) -> Result<&dyn Validator, ValidationError> {
        let ns = Self::namespace_of(key).ok_or(ValidationError::UnknownNamespace)?;
        self.validators
            .get(ns)
            .map(|v| v.as_ref())
            .ok_or(ValidationError::UnknownNamespace)
    }

    pub fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), ValidationError> {
        self.validator_for(key)?.validate(key, value)
    }

    /// Index of the winning value among `values`; `Err` if `key`'s
    /// namespace has no registered validator. `values` must be non-empty.
    pub fn select(&self, key: &[u8], values: &[&[u8]]) -> Result<usize, ValidationError> {
        let validator = self.validator_for(key)?;
        Ok(validator.select(key, values))
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk_key(value: &[u8]) -> Vec<u8> {
        let digest = Sha256::digest(value);
        let mut key = b"/pk/".to_vec();
        key.extend_from_slice(&digest);
        key
    }

    #[test]
    fn pk_validator_accepts_matching_digest() {
        let registry = ValidatorRegistry::new();
        let value = b"a-public-key".to_vec();
        let key = pk_key(&value);
        assert!(registry.validate(&key, &value).is_ok());
    }

    #[test]
    fn pk_validator_rejects_mismatched_digest() {
        let registry = ValidatorRegistry::new();
        let key = pk_key(b"a-public-key");
        assert_eq!(
            registry.validate(&key, b"a-different-value"),
            Err(ValidationError::Malformed)
        );
    }

    #[test]
    fn unknown_namespace_is_rejected() {
        let registry = ValidatorRegistry::new();
        assert_eq!(
            registry.validate(b"/unknown/abc", b"value"),
            Err(ValidationError::UnknownNamespace)
        );
    }

    #[test]
    fn namespace_of_parses_leading_segment() {
        assert_eq!(ValidatorRegistry::namespace_of(b"/pk/abcd"), Some(&b"pk"[..]));
        assert_eq!(ValidatorRegistry::namespace_of(b"no-leading-slash"), None);
    }
}
