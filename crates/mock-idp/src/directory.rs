//! Canned users, groups and search documents.

use serde_json::{json, Value};

/// A sign-in identity. The authorization code is the user's `login`.
pub struct User {
    pub login: &'static str,
    pub oid: &'static str,
    pub name: &'static str,
    pub job_title: &'static str,
    pub groups: &'static [&'static str],
    /// Has a data-reader role on the search index.
    pub search_reader: bool,
    /// Has consented to the relay's downstream permissions.
    pub consented: bool,
}

impl User {
    pub fn upn(&self) -> String {
        format!("{}@contoso.test", self.login)
    }
}

pub const TENANT_ID: &str = "00000000-0000-0000-0000-00000000cafe";

pub const USERS: &[User] = &[
    User {
        login: "alice",
        oid: "11111111-1111-1111-1111-111111111111",
        name: "Alice Analyst",
        job_title: "Analyst",
        groups: &["grp-finance", "grp-all-staff"],
        search_reader: true,
        consented: true,
    },
    User {
        login: "bob",
        oid: "22222222-2222-2222-2222-222222222222",
        name: "Bob Builder",
        job_title: "Engineer",
        groups: &[],
        search_reader: false,
        consented: true,
    },
    User {
        login: "carol",
        oid: "33333333-3333-3333-3333-333333333333",
        name: "Carol Contractor",
        job_title: "Contractor",
        groups: &["grp-all-staff"],
        search_reader: true,
        consented: false,
    },
];

pub fn user_by_login(login: &str) -> Option<&'static User> {
    USERS.iter().find(|u| u.login.eq_ignore_ascii_case(login))
}

pub fn user_by_oid(oid: &str) -> Option<&'static User> {
    USERS.iter().find(|u| u.oid == oid)
}

/// Index documents; `security_groups` drives access.
pub fn documents() -> Vec<Value> {
    vec![
        json!({
            "name": "Annual budget",
            "description": "Finance plan for the coming year",
            "location": "finance/budget.xlsx",
            "GroupIds": ["grp-finance"],
            "UserIds": [],
            "security_groups": ["grp-finance"],
        }),
        json!({
            "name": "Holiday calendar",
            "description": "Company-wide public holidays",
            "location": "hr/holidays.pdf",
            "GroupIds": ["grp-all-staff"],
            "UserIds": [],
            "security_groups": ["grp-all-staff"],
        }),
        json!({
            "name": "Lake house booking",
            "description": "Shared lake house reservations",
            "location": "facilities/lake-house.docx",
            "GroupIds": ["grp-all-staff"],
            "UserIds": [],
            "security_groups": ["grp-all-staff"],
        }),
        json!({
            "name": "Board minutes",
            "description": "Restricted board meeting notes",
            "location": "board/minutes.docx",
            "GroupIds": ["grp-board"],
            "UserIds": [],
            "security_groups": ["grp-board"],
        }),
    ]
}

/// Values quoted in an OData `any(...)` filter, with `''` unescaped.
pub fn quoted_values(filter: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut chars = filter.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut value = String::new();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    value.push('\'');
                } else {
                    break;
                }
            } else {
                value.push(c);
            }
        }
        values.push(value);
    }
    values
}

/// Documents visible to `groups` that match `query`, at most `top`.
pub fn search(query: &str, groups: Option<&[String]>, top: usize) -> Vec<Value> {
    let query = query.trim().to_lowercase();
    documents()
        .into_iter()
        .filter(|doc| match groups {
            None => true,
            Some(groups) => doc["security_groups"]
                .as_array()
                .is_some_and(|allowed| allowed.iter().any(|g| g.as_str().is_some_and(|g| groups.iter().any(|u| u == g)))),
        })
        .filter(|doc| {
            query.is_empty()
                || query == "*"
                || ["name", "description"].iter().any(|field| {
                    doc[*field]
                        .as_str()
                        .is_some_and(|text| text.to_lowercase().contains(&query))
                })
        })
        .take(top)
        .collect()
}
