// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Destination Addresses
//!
//! A destination address names one command of one service of one application inside a
//! grouping of queues (an exchange). Its canonical form is
//! `application.service.command@exchange`; the part before `@` doubles as the routing key.

use crate::errors::MessagingError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Immutable address of a logical destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationAddress {
    /// Logical grouping of queues for all applications that make up a system.
    pub exchange: String,
    /// Application wanting to send messages on the exchange.
    pub application: String,
    /// Service or component of the application.
    pub service: String,
    /// Individual command (or method) of the service.
    pub command: String,
}

impl DestinationAddress {
    /// Creates an address from its four components.
    ///
    /// Application, service and command must be non-empty and free of `.` and `@`; the
    /// exchange must be non-empty and free of `@`. Anything else could not be told apart
    /// from another address once formatted.
    pub fn new(
        application: &str,
        service: &str,
        command: &str,
        exchange: &str,
    ) -> Result<Self, MessagingError> {
        let is_segment = |part: &str| !part.is_empty() && !part.contains(['.', '@']);

        if ![application, service, command].into_iter().all(is_segment)
            || exchange.is_empty()
            || exchange.contains('@')
        {
            return Err(MessagingError::InvalidAddressError(format!(
                "{}.{}.{}@{}",
                application, service, command, exchange
            )));
        }

        Ok(DestinationAddress {
            exchange: exchange.to_owned(),
            application: application.to_owned(),
            service: service.to_owned(),
            command: command.to_owned(),
        })
    }

    /// Parses an address formatted like `application.service.command@exchange`.
    pub fn parse(src: &str) -> Result<Self, MessagingError> {
        let invalid = || MessagingError::InvalidAddressError(src.to_owned());

        let mut halves = src.split('@');
        let (Some(routing_key), Some(exchange), None) = (halves.next(), halves.next(), halves.next())
        else {
            return Err(invalid());
        };

        let mut segments = routing_key.split('.');
        let (Some(application), Some(service), Some(command), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(invalid());
        };

        DestinationAddress::new(application, service, command, exchange).map_err(|_| invalid())
    }

    /// The routing key identifying the command within its exchange:
    /// `application.service.command`.
    pub fn routing_key(&self) -> String {
        format!("{}.{}.{}", self.application, self.service, self.command)
    }
}

impl FromStr for DestinationAddress {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DestinationAddress::parse(s)
    }
}

impl fmt::Display for DestinationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.routing_key(), self.exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_components() {
        let addr: DestinationAddress = "billing.invoices.create@shop".parse().unwrap();

        assert_eq!(addr.application, "billing");
        assert_eq!(addr.service, "invoices");
        assert_eq!(addr.command, "create");
        assert_eq!(addr.exchange, "shop");
        assert_eq!(addr.routing_key(), "billing.invoices.create");
    }

    #[test]
    fn canonical_form_round_trips() {
        for src in [
            "a.b.c@d",
            "billing.invoices.create@shop",
            "app-1.svc_2.cmd-3@exchange.with-dash",
        ] {
            let addr = DestinationAddress::parse(src).unwrap();
            assert_eq!(addr.to_string(), src);
            assert_eq!(DestinationAddress::parse(&addr.to_string()).unwrap(), addr);
        }
    }

    #[test]
    fn rejects_malformed_addresses() {
        for src in [
            "",
            "a.b.c",
            "a.b@d",
            "a.b.c.e@d",
            "a.b.c@d@e",
            "a.b.c@",
            "a..c@d",
            "@d",
        ] {
            assert_eq!(
                DestinationAddress::parse(src),
                Err(MessagingError::InvalidAddressError(src.to_owned())),
                "{src} should not parse"
            );
        }
    }

    #[test]
    fn built_addresses_survive_formatting() {
        let addr = DestinationAddress::new("billing", "invoices", "create", "shop.eu").unwrap();
        assert_eq!(DestinationAddress::parse(&addr.to_string()).unwrap(), addr);

        for (application, service, command, exchange) in [
            ("billing.v2", "invoices", "create", "shop"),
            ("billing", "invoices@eu", "create", "shop"),
            ("billing", "", "create", "shop"),
            ("billing", "invoices", "create", "shop@eu"),
            ("billing", "invoices", "create", ""),
        ] {
            assert!(
                DestinationAddress::new(application, service, command, exchange).is_err(),
                "{application}.{service}.{command}@{exchange} should be rejected"
            );
        }
    }

    #[test]
    fn equal_addresses_hash_alike() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(DestinationAddress::new("a", "b", "c", "d").unwrap());
        assert!(set.contains(&DestinationAddress::parse("a.b.c@d").unwrap()));
    }
}
