//! Command handlers and the default command table.

pub mod messaging;
pub mod registration;
pub mod server;

use super::burst;
use super::msgtab::*;

/// The commands every server carries.
pub fn commands() -> Vec<CommandSpec> {
    use Registration as R;
    vec![
        CommandSpec::new("PRIVMSG", TOK_PRIVMSG, messaging::m_privmsg).slow(),
        CommandSpec::new("NOTICE", TOK_NOTICE, messaging::m_notice)
            .slow()
            .registration(R::RequiredQuiet),
        CommandSpec::new("NICK", TOK_NICK, registration::m_nick)
            .slow()
            .registration(R::Open),
        CommandSpec::new("SERVER", TOK_SERVER, server::m_server)
            .slow()
            .registration(R::Handshake),
        CommandSpec::new("QUIT", TOK_QUIT, registration::m_quit)
            .params(0, 1)
            .slow()
            .registration(R::Open),
        CommandSpec::new("SQUIT", TOK_SQUIT, server::m_squit)
            .params(1, MAXPARA)
            .slow()
            .registration(R::Operator),
        CommandSpec::new("KILL", TOK_KILL, messaging::m_kill)
            .params(2, 2)
            .slow()
            .registration(R::Operator),
        CommandSpec::new("ERROR", TOK_ERROR, registration::m_error)
            .slow()
            .registration(R::Handshake),
        CommandSpec::new("PING", TOK_PING, registration::m_ping).slow(),
        CommandSpec::new("PONG", TOK_PONG, registration::m_pong).registration(R::Open),
        CommandSpec::new("PASS", TOK_PASS, registration::m_pass)
            .params(1, MAXPARA)
            .slow()
            .registration(R::Unregistered),
        CommandSpec::new("USER", TOK_USER, registration::m_user)
            .params(4, MAXPARA)
            .slow()
            .registration(R::Unregistered),
        CommandSpec::new("OPER", TOK_OPER, registration::m_oper)
            .params(2, MAXPARA)
            .slow(),
        CommandSpec::new("WALLOPS", TOK_WALLOPS, messaging::m_wallops)
            .params(1, 1)
            .slow()
            .registration(R::Operator),
        CommandSpec::new("CONNECT", TOK_CONNECT, server::mo_connect)
            .params(1, MAXPARA)
            .slow()
            .registration(R::Operator),
        CommandSpec::new("TOPIC", TOK_TOPIC, messaging::m_topic)
            .params(1, MAXPARA)
            .slow(),
        CommandSpec::new("JOIN", TOK_JOIN, messaging::m_join)
            .params(1, MAXPARA)
            .slow(),
        CommandSpec::new("BURST", TOK_BURST, burst::ms_burst)
            .params(2, MAXPARA)
            .registration(R::Links),
        CommandSpec::new("CREATE", TOK_CREATE, burst::ms_create)
            .params(2, MAXPARA)
            .registration(R::Links),
        CommandSpec::new("END_OF_BURST", TOK_END_OF_BURST, burst::ms_end_of_burst).registration(R::Links),
        CommandSpec::new("EOB_ACK", TOK_EOB_ACK, burst::ms_end_of_burst_ack).registration(R::Links),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_builds() {
        let table = CommandTable::build(commands()).unwrap();
        for spec in table.specs() {
            assert_eq!(table.find_client(spec.name).map(|s| s.name), Some(spec.name));
            assert_eq!(table.find_server(spec.token).map(|s| s.name), Some(spec.name), "{}", spec.token);
            assert_eq!(table.find_server(spec.name).map(|s| s.name), Some(spec.name), "{}", spec.name);
        }
    }

    #[test]
    fn notice_is_not_nick() {
        let table = CommandTable::build(commands()).unwrap();
        assert_eq!(table.find_client("NOTICE").map(|s| s.name), Some("NOTICE"));
        assert_eq!(table.find_server("O").map(|s| s.name), Some("NOTICE"));
        assert_eq!(table.find_server("N").map(|s| s.name), Some("NICK"));
    }
}
