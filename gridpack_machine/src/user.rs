//! Request-scoped identity, parsed from the headers the SSO proxy puts in
//! front of the service. Outside a request the actor is `automatic`.

use std::collections::HashSet;

use hyper::HeaderMap;
use serde::Serialize;

use crate::gridpack::AUTOMATIC_USER;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub username: String,
    pub name: String,
    pub email: String,
    pub authorized: bool,
}

impl User {
    pub fn automatic() -> Self {
        User {
            username: AUTOMATIC_USER.to_string(),
            name: AUTOMATIC_USER.to_string(),
            email: String::new(),
            authorized: false,
        }
    }

    /// Either one of the user's groups is authorized, or the username
    /// itself is listed.
    pub fn from_headers(headers: &HeaderMap, authorized: &HashSet<String>) -> Self {
        let header = |name: &str| -> String {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let username = header("Adfs-Login");
        let groups: HashSet<String> = header("Adfs-Group")
            .replace(',', ";")
            .split(';')
            .map(|group| group.trim().to_lowercase())
            .filter(|group| !group.is_empty())
            .collect();
        let is_authorized =
            !groups.is_disjoint(authorized) || authorized.contains(&username);

        User {
            username,
            name: header("Adfs-Fullname"),
            email: header("Adfs-Email"),
            authorized: is_authorized,
        }
    }
}
