use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use rustc_hash::{FxHashMap, FxHashSet};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

#[cfg(test)] use mockall::automock;

/// Credential and per-path access checks, as consulted by the filesystem server
#[cfg_attr(test, automock)]
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, username: &str, password: &str) -> bool;

    fn authorize_path(&self, username: &str, path: &str) -> bool;
}

/// Users with their password hashes, and path prefixes with the users allowed below them.
///
/// The users file has one `<name> <sha256 hex of password>` per line. The ACL file has one
///  `<path prefix> [<user>...]` per line. For a given path, the longest matching prefix decides;
///  a prefix without users, or a path that no prefix matches, is accessible to everybody.
#[derive(Debug, Default)]
pub struct Acl {
    users: FxHashMap<String, String>,
    filters: BTreeMap<String, FxHashSet<String>>,
}

impl Acl {
    /// Reads the users file and, if given, the ACL file. Without an ACL file every path is
    ///  accessible to every authenticated user.
    pub fn load(acl_path: Option<&Path>, users_path: &Path) -> anyhow::Result<Acl> {
        let acl = match acl_path {
            Some(acl_path) => std::fs::read_to_string(acl_path)
                .with_context(|| format!("reading ACL file {:?}", acl_path))?,
            None => String::new(),
        };
        let users = std::fs::read_to_string(users_path)
            .with_context(|| format!("reading users file {:?}", users_path))?;
        Self::parse(&acl, &users)
    }

    pub fn parse(acl: &str, users: &str) -> anyhow::Result<Acl> {
        let mut result = Acl::default();

        for line in users.lines().filter(|l| !l.trim().is_empty()) {
            let tokens = line.split_whitespace().collect::<Vec<_>>();
            if tokens.len() != 2 {
                bail!("could not parse user definition: {}", line);
            }
            if tokens[1].len() != 64 {
                bail!("could not parse user definition (wrong hash length): {}", line);
            }
            result.users.insert(tokens[0].to_string(), tokens[1].to_ascii_lowercase());
        }

        for line in acl.lines() {
            let mut tokens = line.split_whitespace();
            let Some(prefix) = tokens.next() else {
                continue;
            };
            result.filters.insert(prefix.to_string(), tokens.map(|s| s.to_string()).collect());
        }

        info!("loaded {} users and {} ACL entries", result.users.len(), result.filters.len());
        for (prefix, users) in &result.filters {
            debug!("ACL: {} -> {:?}", prefix, users);
        }

        Ok(result)
    }

    fn password_hash(password: &str) -> String {
        hex::encode(Sha256::digest(password.as_bytes()))
    }
}

impl Authorizer for Acl {
    fn authorize(&self, username: &str, password: &str) -> bool {
        match self.users.get(username) {
            Some(expected) => *expected == Self::password_hash(password),
            None => false,
        }
    }

    fn authorize_path(&self, username: &str, path: &str) -> bool {
        let best_match = self.filters.iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());

        match best_match {
            None => true,
            Some((_, users)) => users.is_empty() || users.contains(username),
        }
    }
}
