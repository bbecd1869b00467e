//! Jid helpers.
//!
//! A jid looks like `<user>[:<device>]@<server>`; the server decides what
//! kind of room or account it names.

/// Server of one-to-one chats
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Status updates room
pub const STATUS_BROADCAST: &str = "status@broadcast";

/// User part of a jid with any device suffix removed
pub fn local_part(jid: &str) -> &str {
    let user = jid.split('@').next().unwrap_or(jid);
    user.split(':').next().unwrap_or(user)
}

/// Server part of a jid (empty when absent)
pub fn server(jid: &str) -> &str {
    jid.split_once('@').map(|(_, server)| server).unwrap_or("")
}

/// Numeric id of a jid's user part, if it is a phone number
pub fn numeric_id(jid: &str) -> Option<u64> {
    local_part(jid).parse().ok()
}

pub fn is_group(jid: &str) -> bool {
    server(jid) == "g.us"
}

pub fn is_broadcast(jid: &str) -> bool {
    server(jid) == "broadcast"
}

pub fn is_status(jid: &str) -> bool {
    jid == STATUS_BROADCAST
}

pub fn is_newsletter(jid: &str) -> bool {
    server(jid) == "newsletter"
}

pub fn is_lid(jid: &str) -> bool {
    server(jid) == "lid"
}

/// Device-less user jid, e.g. `628123:4@s.whatsapp.net` → `628123@s.whatsapp.net`
pub fn normalize_user(jid: &str) -> String {
    let server = server(jid);
    if server.is_empty() {
        return local_part(jid).to_string();
    }
    format!("{}@{}", local_part(jid), server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts() {
        assert_eq!(local_part("628123:4@s.whatsapp.net"), "628123");
        assert_eq!(local_part("123@g.us"), "123");
        assert_eq!(local_part("bare"), "bare");
        assert_eq!(server("123@g.us"), "g.us");
        assert_eq!(numeric_id("99@s.whatsapp.net"), Some(99));
        assert_eq!(numeric_id("abc@lid"), None);
    }

    #[test]
    fn test_kinds() {
        assert!(is_group("123@g.us"));
        assert!(is_broadcast(STATUS_BROADCAST));
        assert!(is_status(STATUS_BROADCAST));
        assert!(is_newsletter("1203@newsletter"));
        assert!(is_lid("8877@lid"));
        assert!(!is_group("99@s.whatsapp.net"));
    }

    #[test]
    fn test_normalize_user() {
        assert_eq!(normalize_user("628123:4@s.whatsapp.net"), "628123@s.whatsapp.net");
        assert_eq!(normalize_user("628123"), "628123");
    }
}
