//! User and role management.
//!
//! An in-memory cache of identities with their expanded ability sets. Roles
//! name sets of abilities; user role strings are expanded token by token,
//! tokens that are not roles are taken as literal abilities. Auth contexts
//! inherit from a parent copy-on-write: the first mutation clones the
//! parent's tables.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub abilities: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub password: String,
    /// Declared roles string as configured, before expansion.
    pub roles: String,
    pub abilities: BTreeSet<String>,
}

impl User {
    pub fn has_ability(&self, ability: &str) -> bool {
        self.abilities.contains(ability)
    }
}

#[derive(Debug, Default)]
pub struct Auth {
    pub realm: String,
    parent: Option<Arc<Auth>>,
    roles: Option<HashMap<String, Arc<Role>>>,
    users: Option<HashMap<String, Arc<User>>>,
}

impl Auth {
    pub fn new(realm: impl Into<String>) -> Self {
        Auth {
            realm: realm.into(),
            parent: None,
            roles: None,
            users: None,
        }
    }

    /// Creates a child context that shares the parent's tables until its
    /// first mutation.
    pub fn inherit(parent: &Arc<Auth>) -> Self {
        Auth {
            realm: parent.realm.clone(),
            parent: Some(parent.clone()),
            roles: None,
            users: None,
        }
    }

    fn roles_ref(&self) -> Option<&HashMap<String, Arc<Role>>> {
        self.roles
            .as_ref()
            .or_else(|| self.parent.as_ref().and_then(|p| p.roles_ref()))
    }

    fn users_ref(&self) -> Option<&HashMap<String, Arc<User>>> {
        self.users
            .as_ref()
            .or_else(|| self.parent.as_ref().and_then(|p| p.users_ref()))
    }

    fn roles_mut(&mut self) -> &mut HashMap<String, Arc<Role>> {
        if self.roles.is_none() {
            let inherited = self
                .parent
                .as_ref()
                .and_then(|p| p.roles_ref())
                .cloned()
                .unwrap_or_default();
            self.roles = Some(inherited);
        }
        self.roles.as_mut().expect("just graduated")
    }

    fn users_mut(&mut self) -> &mut HashMap<String, Arc<User>> {
        if self.users.is_none() {
            let inherited = self
                .parent
                .as_ref()
                .and_then(|p| p.users_ref())
                .cloned()
                .unwrap_or_default();
            self.users = Some(inherited);
        }
        self.users.as_mut().expect("just graduated")
    }

    /// Defines a role from a whitespace-separated abilities string. Redefines
    /// replace the previous ability set.
    pub fn add_role(&mut self, name: &str, abilities: &str) -> Arc<Role> {
        let role = Arc::new(Role {
            name: name.to_string(),
            abilities: abilities
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        });
        tracing::debug!(role = name, abilities, "role defined");
        self.roles_mut().insert(name.to_string(), role.clone());
        role
    }

    pub fn lookup_role(&self, name: &str) -> Option<Arc<Role>> {
        self.roles_ref().and_then(|r| r.get(name)).cloned()
    }

    pub fn remove_role(&mut self, name: &str) -> bool {
        self.roles_mut().remove(name).is_some()
    }

    /// Expands one role token into `abilities`: a known role contributes its
    /// ability set, anything else is taken as a literal ability.
    pub fn compute_role_abilities(&self, abilities: &mut BTreeSet<String>, role: &str) {
        match self.lookup_role(role) {
            Some(role) => {
                abilities.extend(role.abilities.iter().cloned());
            }
            None => {
                abilities.insert(role.to_string());
            }
        }
    }

    fn expand_roles(&self, roles: &str) -> BTreeSet<String> {
        let mut abilities = BTreeSet::new();
        for token in roles.split(|c: char| c.is_whitespace() || c == ',') {
            if !token.is_empty() {
                self.compute_role_abilities(&mut abilities, token);
            }
        }
        abilities
    }

    /// Adds (or redefines) a user. A roles string, when given, is expanded
    /// into the user's ability set.
    pub fn add_user(&mut self, name: &str, password: &str, roles: Option<&str>) -> Arc<User> {
        let (roles_string, abilities) = match roles {
            Some(roles) => (roles.to_string(), self.expand_roles(roles)),
            None => (String::new(), BTreeSet::new()),
        };
        let user = Arc::new(User {
            name: name.to_string(),
            password: password.to_string(),
            roles: roles_string,
            abilities,
        });
        self.users_mut().insert(name.to_string(), user.clone());
        user
    }

    pub fn lookup_user(&self, name: &str) -> Option<Arc<User>> {
        self.users_ref().and_then(|u| u.get(name)).cloned()
    }

    pub fn remove_user(&mut self, name: &str) -> bool {
        self.users_mut().remove(name).is_some()
    }

    pub fn rename_user(&mut self, from: &str, to: &str) -> bool {
        let users = self.users_mut();
        match users.remove(from) {
            Some(user) => {
                let mut renamed = (*user).clone();
                renamed.name = to.to_string();
                users.insert(to.to_string(), Arc::new(renamed));
                true
            }
            None => false,
        }
    }

    /// Re-expands every cached user's abilities after role mutations.
    pub fn compute_all_user_abilities(&mut self) {
        let users = self.users_ref().cloned().unwrap_or_default();
        let mut updated = HashMap::with_capacity(users.len());
        for (name, user) in users {
            let mut user = (*user).clone();
            user.abilities = self.expand_roles(&user.roles);
            updated.insert(name, Arc::new(user));
        }
        self.users = Some(updated);
    }

    /// Expands a roles string into a stable separator-joined ability list
    /// for authorisation tests and tracing.
    pub fn roles_to_abilities(&self, roles: &str, separator: &str) -> String {
        let abilities = self.expand_roles(roles);
        abilities.into_iter().collect::<Vec<_>>().join(separator)
    }
}

#[cfg(test)]
mod users {
    use super::*;

    fn auth() -> Auth {
        let mut auth = Auth::new("example.com");
        auth.add_role("admin", "view edit delete manage");
        auth.add_role("viewer", "view");
        auth
    }

    #[test]
    fn role_abilities_parse() {
        let auth = auth();
        let admin = auth.lookup_role("admin").unwrap();
        assert_eq!(admin.abilities.len(), 4);
        assert!(admin.abilities.contains("manage"));
    }

    #[test]
    fn user_roles_expand_to_abilities() {
        let mut auth = auth();
        let user = auth.add_user("alice", "s3cret", Some("viewer publish"));

        // "viewer" is a role, "publish" is a literal ability.
        assert!(user.has_ability("view"));
        assert!(user.has_ability("publish"));
        assert!(!user.has_ability("edit"));
    }

    #[test]
    fn user_without_roles_has_no_abilities() {
        let mut auth = auth();
        let user = auth.add_user("bob", "pw", None);
        assert!(user.abilities.is_empty());
    }

    #[test]
    fn recompute_after_role_mutation() {
        let mut auth = auth();
        auth.add_user("alice", "pw", Some("viewer"));
        assert!(!auth.lookup_user("alice").unwrap().has_ability("edit"));

        auth.add_role("viewer", "view edit");
        auth.compute_all_user_abilities();
        assert!(auth.lookup_user("alice").unwrap().has_ability("edit"));
    }

    #[test]
    fn roles_to_abilities_is_stable() {
        let auth = auth();
        assert_eq!(
            auth.roles_to_abilities("admin", " "),
            "delete edit manage view"
        );
        assert_eq!(auth.roles_to_abilities("viewer custom", ","), "custom,view");
        assert_eq!(
            auth.roles_to_abilities("admin", " "),
            auth.roles_to_abilities("admin", " ")
        );
    }

    #[test]
    fn lookup_remove_rename() {
        let mut auth = auth();
        auth.add_user("carol", "pw", None);

        assert!(auth.lookup_user("carol").is_some());
        assert!(auth.rename_user("carol", "carla"));
        assert!(auth.lookup_user("carol").is_none());
        assert_eq!(auth.lookup_user("carla").unwrap().name, "carla");

        assert!(auth.remove_user("carla"));
        assert!(!auth.remove_user("carla"));
        assert!(auth.remove_role("viewer"));
        assert!(!auth.remove_role("viewer"));
    }

    #[test]
    fn inheritance_is_copy_on_write() {
        let mut parent = auth();
        parent.add_user("alice", "pw", Some("admin"));
        let parent = Arc::new(parent);

        let mut child = Auth::inherit(&parent);
        assert!(child.lookup_user("alice").is_some());

        // Mutating the child clones the tables; the parent is untouched.
        child.add_user("dave", "pw", Some("viewer"));
        assert!(child.lookup_user("dave").is_some());
        assert!(parent.lookup_user("dave").is_none());

        child.remove_user("alice");
        assert!(parent.lookup_user("alice").is_some());
    }
}
