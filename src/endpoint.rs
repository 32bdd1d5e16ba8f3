//! Address and port validation, done before any socket is created.
use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};
use crate::sink::Log;

/// Every problem with an IP literal and a port typed by the user, or the socket address they make.
///
/// The address and the port are checked independently, so a bad pair yields both complaints. The
/// port has to be an integer in `0..=65535`; anything else is rejected before the network is
/// touched.
pub fn check(address: &str, port: &str) -> std::result::Result<SocketAddr, Vec<Error>> {
    let ip = address.trim().parse::<IpAddr>();
    let port = match port.trim().parse::<i64>() {
        Ok(n) if n < 0 || n > i64::from(u16::max_value()) => Err(Error::PortOutOfRange(n)),
        Ok(n) => Ok(n as u16),
        Err(_) => Err(Error::InvalidPort(port.to_string())),
    };
    match (ip, port) {
        (Ok(ip), Ok(port)) => Ok(SocketAddr::new(ip, port)),
        (ip, port) => {
            let mut problems = Vec::new();
            if ip.is_err() {
                problems.push(Error::InvalidAddress(address.to_string()));
            }
            if let Err(err) = port {
                problems.push(err);
            }
            Err(problems)
        }
    }
}

/// Like [`check`], but only the first problem is returned.
pub fn parse(address: &str, port: &str) -> Result<SocketAddr> {
    check(address, port).map_err(|mut problems| problems.remove(0))
}

/// [`check`] for a control surface: every problem is written to `log`, the first one returned.
pub fn parse_logged(address: &str, port: &str, log: &Log) -> Result<SocketAddr> {
    check(address, port).map_err(|mut problems| {
        for problem in &problems {
            log.notice(problem);
        }
        problems.remove(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_v4_and_v6_literals() {
        assert_eq!(parse("127.0.0.1", "9000").unwrap(), "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(parse(" ::1 ", "0").unwrap(), "[::1]:0".parse::<SocketAddr>().unwrap());
        assert_eq!(parse("10.0.0.2", "65535").unwrap().port(), 65535);
    }

    #[test]
    fn rejects_bad_addresses() {
        match parse("localhost", "9000") {
            Err(Error::InvalidAddress(addr)) => assert_eq!(addr, "localhost"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse("256.0.0.1", "9000").is_err());
    }

    #[test]
    fn rejects_ports_that_are_not_integers() {
        match parse("127.0.0.1", "90a") {
            Err(Error::InvalidPort(port)) => assert_eq!(port, "90a"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_ports_out_of_range() {
        match parse("127.0.0.1", "70000") {
            Err(err @ Error::PortOutOfRange(70000)) => {
                assert_eq!(err.to_string(), "Port is out of range")
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse("127.0.0.1", "-1") {
            Err(Error::PortOutOfRange(-1)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reports_address_and_port_together() {
        match check("nowhere", "99999") {
            Err(problems) => {
                let text: Vec<String> = problems.iter().map(|p| p.to_string()).collect();
                assert_eq!(text, vec!["Address is not valid", "Port is out of range"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse("nowhere", "x") {
            Err(Error::InvalidAddress(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
