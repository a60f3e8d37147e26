use crate::{
    cluster::MembershipService,
    config::Config,
    discovery::{self, Discovery},
    error::{Error, Result},
    member::Member,
    transport::{Broadcaster, Messaging},
};
use std::sync::Arc;

/// Assembles a [`MembershipService`] from its collaborators.
///
/// Only the messaging transport is required. Without a member an anonymous
/// one is created at the messaging address, and without an explicit
/// discovery strategy the one named in the config is used.
#[derive(Default)]
pub struct Builder {
    member: Option<Member>,
    config: Option<Config>,
    messaging: Option<Arc<dyn Messaging>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl Builder {
    pub fn member(mut self, member: Member) -> Self {
        self.member = Some(member);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn messaging<M: Messaging>(mut self, messaging: M) -> Self {
        self.messaging = Some(Arc::new(messaging));
        self
    }

    pub fn broadcaster<B: Broadcaster>(mut self, broadcaster: B) -> Self {
        self.broadcaster = Some(Arc::new(broadcaster));
        self
    }

    pub fn discovery<D: Discovery>(mut self, discovery: D) -> Self {
        self.discovery = Some(Arc::new(discovery));
        self
    }

    pub fn finish(self) -> Result<MembershipService> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let messaging = self
            .messaging
            .ok_or_else(|| Error::new_config(Some("a messaging transport is required".into())))?;

        let mut member = self.member.unwrap_or_else(|| Member::builder().build());
        if member.address().port() == 0 {
            member.address = messaging.address().clone();
        }

        let discovery = match self.discovery {
            Some(discovery) => discovery,
            None => discovery::from_config(
                &config.discovery,
                messaging.address(),
                self.broadcaster.clone(),
            )?,
        };

        Ok(MembershipService::new(
            member,
            config,
            messaging,
            self.broadcaster,
            discovery,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::{Address, IdKind},
        config::DiscoveryConfig,
        error::ErrorKind,
        transport::local::LocalNetwork,
    };
    use std::time::Duration;

    #[test]
    fn anonymous_member_at_messaging_address() {
        let network = LocalNetwork::new();
        let service = MembershipService::builder()
            .messaging(network.messaging(Address::new("localhost", 7)))
            .finish()
            .unwrap();

        let local = service.local_member();
        assert_eq!(local.id().kind(), IdKind::Anonymous);
        assert_eq!(local.address(), &Address::new("localhost", 7));
    }

    #[test]
    fn messaging_is_required() {
        let err = MembershipService::builder().finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let network = LocalNetwork::new();
        let config = Config {
            gossip_fanout: 0,
            ..Config::default()
        };

        let err = MembershipService::builder()
            .config(config)
            .messaging(network.messaging(Address::new("localhost", 7)))
            .finish()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn multicast_from_config_needs_broadcaster() {
        let network = LocalNetwork::new();
        let config = Config {
            discovery: DiscoveryConfig::Multicast {
                window: Duration::from_millis(500),
            },
            ..Config::default()
        };

        let err = MembershipService::builder()
            .config(config.clone())
            .messaging(network.messaging(Address::new("localhost", 7)))
            .finish()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        assert!(MembershipService::builder()
            .config(config)
            .messaging(network.messaging(Address::new("localhost", 7)))
            .broadcaster(network.broadcaster(Address::new("localhost", 7)))
            .finish()
            .is_ok());
    }
}
