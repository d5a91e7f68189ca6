//! Access control for restricted classes. Every restricted class has up to four principal lists:
//!  who may transmit, who may subscribe, who may subscribe to all instances, and who may send to
//!  instances other than their own principal. A missing list does not restrict that kind of
//!  access, but transmitting to a restricted class always requires authentication.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::notice::notice::{AuthStatus, Notice};
use crate::realm::subscriptions::WILDCARD_INSTANCE;

pub const CLASS_REGISTRY_FILE: &str = "class-registry.acl";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AccessType {
    Transmit,
    Subscribe,
    /// subscribing with the wildcard instance
    InstanceWildcard,
    /// transmitting with an instance other than the sender's principal
    InstanceUid,
}

impl AccessType {
    pub const ALL: [AccessType; 4] = [AccessType::Transmit, AccessType::Subscribe, AccessType::InstanceWildcard, AccessType::InstanceUid];

    fn file_prefix(self) -> &'static str {
        match self {
            AccessType::Transmit => "xmt",
            AccessType::Subscribe => "sub",
            AccessType::InstanceWildcard => "iws",
            AccessType::InstanceUid => "iui",
        }
    }

    pub fn file_name(self, class: &str) -> String {
        format!("{}-{}.acl", self.file_prefix(), class)
    }
}

/// Principals granted one kind of access. An entry `*` matches every principal, `*@REALM` every
///  principal of a realm; everything else matches exactly.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PrincipalList(Vec<String>);

impl PrincipalList {
    pub fn new(entries: &[&str]) -> PrincipalList {
        PrincipalList(entries.iter().map(|e| e.to_string()).collect())
    }

    /// one principal per line; empty lines and lines starting with `#` are ignored
    pub fn parse(text: &str) -> PrincipalList {
        PrincipalList(text.lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.to_string())
            .collect())
    }

    pub fn allows(&self, principal: &str) -> bool {
        self.0.iter().any(|entry| {
            if entry == "*" {
                return true;
            }
            match entry.strip_prefix("*@") {
                Some(realm) => principal.rsplit_once('@')
                    .map(|(_, r)| r.eq_ignore_ascii_case(realm))
                    .unwrap_or(false),
                None => entry == principal,
            }
        })
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ClassAcl {
    lists: FxHashMap<AccessType, PrincipalList>,
}

impl ClassAcl {
    pub fn new() -> ClassAcl {
        Default::default()
    }

    pub fn with(mut self, access: AccessType, principals: PrincipalList) -> ClassAcl {
        self.lists.insert(access, principals);
        self
    }

    pub fn allows(&self, access: AccessType, principal: &str) -> bool {
        self.lists.get(&access)
            .map(|l| l.allows(principal))
            .unwrap_or(true)
    }
}

/// The restricted classes, keyed case-insensitively
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    classes: FxHashMap<String, ClassAcl>,
}

impl AccessControl {
    pub fn new() -> AccessControl {
        Default::default()
    }

    pub fn restrict(&mut self, class: &str, acl: ClassAcl) {
        self.classes.insert(class.to_ascii_uppercase(), acl);
    }

    pub fn num_restricted(&self) -> usize {
        self.classes.len()
    }

    fn acl(&self, class: &str) -> Option<&ClassAcl> {
        self.classes.get(&class.to_ascii_uppercase())
    }

    /// Reads the class registry and the per class principal lists from a directory. Without a
    ///  registry, no class is restricted.
    pub fn load_dir(dir: &Path) -> anyhow::Result<AccessControl> {
        let mut result = AccessControl::new();

        let registry = match fs::read_to_string(dir.join(CLASS_REGISTRY_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(?dir, "no class registry - all classes are unrestricted");
                return Ok(result);
            }
            Err(e) => return Err(anyhow!("error reading class registry in {:?}: {}", dir, e)),
        };

        for line in registry.lines() {
            // a registry line may carry a description after a colon
            let class = line.split(':').next().unwrap_or_default().trim();
            if class.is_empty() || class.starts_with('#') {
                continue;
            }

            let mut acl = ClassAcl::new();
            for access in AccessType::ALL {
                match fs::read_to_string(dir.join(access.file_name(class))) {
                    Ok(text) => acl = acl.with(access, PrincipalList::parse(&text)),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(anyhow!("error reading {} list for class {}: {}", access.file_prefix(), class, e)),
                }
            }
            debug!(class, "restricted class");
            result.restrict(class, acl);
        }
        Ok(result)
    }

    /// Whether a notice may be sent to its class: restricted classes require an authenticated
    ///  sender with transmit access, and access to foreign instances unless the instance is the
    ///  sender's own principal.
    pub fn may_transmit(&self, notice: &Notice) -> bool {
        let Some(acl) = self.acl(&notice.class) else {
            return true;
        };
        if notice.authenticated != AuthStatus::Yes {
            return false;
        }
        if !acl.allows(AccessType::Transmit, &notice.sender) {
            return false;
        }
        notice.sender == notice.instance || acl.allows(AccessType::InstanceUid, &notice.sender)
    }

    /// Whether a subscription may be made. `principal` is the authenticated principal of the
    ///  subscriber, if any.
    pub fn may_subscribe(&self, class: &str, instance: &str, principal: Option<&str>) -> bool {
        let Some(acl) = self.acl(class) else {
            return true;
        };
        let Some(principal) = principal else {
            return false;
        };
        if !acl.allows(AccessType::Subscribe, principal) {
            return false;
        }
        instance != WILDCARD_INSTANCE || acl.allows(AccessType::InstanceWildcard, principal)
    }
}
