use std::fmt;

/// Kind of an addressable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Client,
    Mds,
    Osd,
    Mon,
    Namer,
    /// The control endpoint of a rank itself, routed by rank number.
    Rank,
}

impl EntityType {
    pub const fn code(self) -> u8 {
        match self {
            EntityType::Client => 1,
            EntityType::Mds => 2,
            EntityType::Osd => 3,
            EntityType::Mon => 4,
            EntityType::Namer => 5,
            EntityType::Rank => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<EntityType> {
        match code {
            1 => Some(EntityType::Client),
            2 => Some(EntityType::Mds),
            3 => Some(EntityType::Osd),
            4 => Some(EntityType::Mon),
            5 => Some(EntityType::Namer),
            6 => Some(EntityType::Rank),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            EntityType::Client => "client",
            EntityType::Mds => "mds",
            EntityType::Osd => "osd",
            EntityType::Mon => "mon",
            EntityType::Namer => "namer",
            EntityType::Rank => "rank",
        }
    }

    /// Types an application may register; namer and rank endpoints are owned
    /// by the messaging layer.
    pub const fn is_registrable(self) -> bool {
        !matches!(self, EntityType::Namer | EntityType::Rank)
    }
}

/// Location independent address of an entity, e.g. `osd3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityAddr {
    kind: EntityType,
    num: u32,
}

/// Rank number used before the namer has assigned one.
pub const RANK_UNASSIGNED: u32 = u32::MAX;

impl EntityAddr {
    /// The bootstrap namer, always hosted on rank 0.
    pub const NAMER: EntityAddr = EntityAddr {
        kind: EntityType::Namer,
        num: 0,
    };

    pub const fn new(kind: EntityType, num: u32) -> EntityAddr {
        EntityAddr { kind, num }
    }

    pub const fn rank(rank: u32) -> EntityAddr {
        EntityAddr {
            kind: EntityType::Rank,
            num: rank,
        }
    }

    pub const fn kind(&self) -> EntityType {
        self.kind
    }

    pub const fn num(&self) -> u32 {
        self.num
    }

    pub fn is_rank(&self) -> bool {
        self.kind == EntityType::Rank
    }
}

impl fmt::Display for EntityAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == EntityType::Rank && self.num == RANK_UNASSIGNED {
            return write!(f, "rank?");
        }
        write!(f, "{}{}", self.kind.name(), self.num)
    }
}

/// What `register_entity` asks the namer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrRequest {
    /// Next free instance of the type.
    Any(EntityType),
    /// This exact address, refused if it is taken.
    Exact(EntityAddr),
}

impl AddrRequest {
    pub fn kind(&self) -> EntityType {
        match self {
            AddrRequest::Any(kind) => *kind,
            AddrRequest::Exact(addr) => addr.kind(),
        }
    }
}

impl From<EntityType> for AddrRequest {
    fn from(kind: EntityType) -> Self {
        AddrRequest::Any(kind)
    }
}

impl From<EntityAddr> for AddrRequest {
    fn from(addr: EntityAddr) -> Self {
        AddrRequest::Exact(addr)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(EntityAddr::new(EntityType::Client, 7), "client7")]
    #[case(EntityAddr::new(EntityType::Mds, 0), "mds0")]
    #[case(EntityAddr::new(EntityType::Osd, 12), "osd12")]
    #[case(EntityAddr::NAMER, "namer0")]
    #[case(EntityAddr::rank(3), "rank3")]
    #[case(EntityAddr::rank(RANK_UNASSIGNED), "rank?")]
    fn test_display(#[case] addr: EntityAddr, #[case] expected: &str) {
        assert_eq!(addr.to_string(), expected);
    }

    #[test]
    fn test_type_codes_are_distinct() {
        let kinds = [
            EntityType::Client,
            EntityType::Mds,
            EntityType::Osd,
            EntityType::Mon,
            EntityType::Namer,
            EntityType::Rank,
        ];
        for kind in kinds {
            assert_eq!(EntityType::from_code(kind.code()), Some(kind));
        }
        assert_eq!(EntityType::from_code(0), None);
        assert_eq!(EntityType::from_code(200), None);
    }

    #[test]
    fn test_registrable_types() {
        assert!(EntityType::Osd.is_registrable());
        assert!(!EntityType::Namer.is_registrable());
        assert!(!EntityType::Rank.is_registrable());
        assert_eq!(AddrRequest::from(EntityType::Mon).kind(), EntityType::Mon);
    }
}
