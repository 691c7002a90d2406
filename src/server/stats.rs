//! The stats document: a plain-text snapshot of every live connection,
//! shaped as calls for a monitoring page to evaluate.

use super::table::ConnTable;
use std::fmt::Write as _;
use std::time::SystemTime;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Renders the snapshot: `clear();` then one `connection({...});` per live
/// connection.
pub(crate) fn render(table: &ConnTable) -> String {
    let mut doc = String::from("clear();\n");
    for (id, entry) in table.iter() {
        let conn = &entry.conn;
        let user = conn
            .credentials()
            .map_or("", |credentials| credentials.username.as_str());
        let _ = writeln!(
            doc,
            "connection({{\"since\":{since},\"fd\":{fd},\"id\":{id},\"uri\":{uri},\
             \"addr\":{addr},\"user\":{user},\"input\":{input},\"read\":{read},\
             \"output\":{output},\"written\":{written}}});",
            since = js(&local_time_string(entry.accepted_at)),
            fd = conn.fd(),
            id = id,
            uri = js(conn.request_uri().unwrap_or("")),
            addr = js(&conn.remote_address().to_string()),
            user = js(user),
            input = conn.input_buffer_size(),
            read = conn.bytes_received(),
            output = conn.output_buffer_size(),
            written = conn.bytes_sent(),
        );
    }
    doc
}

/// JSON string literal for `s`, handling quoting and escapes.
fn js(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}

/// Acceptance time as a local-time string (UTC if the local offset is
/// unavailable, as it is once threads exist).
fn local_time_string(at: SystemTime) -> String {
    let stamp = OffsetDateTime::from(at);
    let stamp = match UtcOffset::current_local_offset() {
        Ok(offset) => stamp.to_offset(offset),
        Err(_) => stamp,
    };
    stamp
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .unwrap_or_else(|_| String::from("unknown"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Connection;
    use socket2::{Domain, Socket, Type};

    #[test]
    fn empty_table_renders_clear_only() {
        assert_eq!(render(&ConnTable::new()), "clear();\n");
    }

    #[test]
    fn one_record_per_connection() {
        let mut table = ConnTable::new();
        let (ours, _theirs) = Socket::pair(Domain::UNIX, Type::STREAM, None).expect("socketpair");
        let id = table.allocate_id();
        table.insert(
            id,
            Connection::new(ours, id, "10.1.2.3:5555".parse().expect("addr")),
            SystemTime::now(),
        );

        let doc = render(&table);
        assert!(doc.starts_with("clear();\n"));
        assert_eq!(doc.matches("connection({").count(), 1);
        assert!(doc.contains("\"id\":2"));
        assert!(doc.contains("\"addr\":\"10.1.2.3:5555\""));
        assert!(doc.contains("\"uri\":\"\""));
        assert!(doc.contains("\"read\":0"));
        assert!(doc.ends_with("});\n"));
    }

    #[test]
    fn string_values_are_escaped() {
        assert_eq!(js(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(js("plain"), "\"plain\"");
    }

    #[test]
    fn timestamps_format() {
        let rendered = local_time_string(SystemTime::UNIX_EPOCH);
        assert!(rendered.starts_with("1970-01-01"));
    }
}
