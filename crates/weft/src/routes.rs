use std::collections::{HashMap, HashSet};

use crate::{
    LinkId, RouteId, ServerId, ServerIndex, ServerType, UserId,
    error::{NetError, NetResult},
};

pub type RouteMap = HashMap<RouteId, LinkId>;

/// Packs a server identity into one route id:
/// `ServerType << 48 | ServerID << 16 | ServerIndex`.
#[inline]
pub fn pack_route_id(server_type: ServerType, server_id: ServerId, server_index: ServerIndex) -> RouteId {
    let mut route_id = server_type as RouteId;
    route_id <<= ServerId::BITS;
    route_id |= server_id as RouteId;
    route_id <<= ServerIndex::BITS;
    route_id |= server_index as RouteId;
    route_id
}

#[inline]
fn pack_server_type_id(server_type: ServerType, server_id: ServerId) -> RouteId {
    ((server_type as RouteId) << ServerId::BITS) | server_id as RouteId
}

/// A standalone directory mapping identities to links.
///
/// Two index families: users and packed server routes, each with a reverse
/// map keyed by link so a whole link prunes in one pass, plus prefix maps
/// for "every route of this server type" lookups. No reactor dependency;
/// higher layers consult it to target broadcasts.
#[derive(Default)]
pub struct RouteMgr {
    routes: RouteMap,
    route_links: HashMap<LinkId, HashSet<RouteId>>,
    users: HashMap<UserId, LinkId>,
    user_links: HashMap<LinkId, HashSet<UserId>>,
    server_types: HashMap<ServerType, RouteMap>,
    server_type_ids: HashMap<RouteId, RouteMap>,
}

impl RouteMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
        self.route_links.clear();
        self.users.clear();
        self.user_links.clear();
        self.server_types.clear();
        self.server_type_ids.clear();
    }

    /// Non-idempotent: a user already routed answers `LinkRouteExist`.
    pub fn add_route_by_user(&mut self, user_id: UserId, link_id: LinkId) -> NetResult<()> {
        if self.users.contains_key(&user_id) {
            return Err(NetError::LinkRouteExist);
        }
        self.user_links.entry(link_id).or_default().insert(user_id);
        self.users.insert(user_id, link_id);
        Ok(())
    }

    pub fn add_route_by_server(
        &mut self,
        server_type: ServerType,
        server_id: ServerId,
        server_index: ServerIndex,
        link_id: LinkId,
    ) -> NetResult<()> {
        let route_id = pack_route_id(server_type, server_id, server_index);
        if self.routes.contains_key(&route_id) {
            return Err(NetError::LinkRouteExist);
        }
        self.route_links.entry(link_id).or_default().insert(route_id);
        self.routes.insert(route_id, link_id);
        self.server_types.entry(server_type).or_default().insert(route_id, link_id);
        self.server_type_ids
            .entry(pack_server_type_id(server_type, server_id))
            .or_default()
            .insert(route_id, link_id);
        Ok(())
    }

    /// Prunes every index for a link in one pass through the reverse maps.
    pub fn remove_route(&mut self, link_id: LinkId) {
        if let Some(route_ids) = self.route_links.remove(&link_id) {
            for route_id in route_ids {
                let server_type = (route_id >> (ServerId::BITS + ServerIndex::BITS)) as ServerType;
                let server_type_id = route_id >> ServerIndex::BITS;
                self.routes.remove(&route_id);
                if let Some(map) = self.server_types.get_mut(&server_type) {
                    map.remove(&route_id);
                }
                if let Some(map) = self.server_type_ids.get_mut(&server_type_id) {
                    map.remove(&route_id);
                }
            }
        }
        if let Some(user_ids) = self.user_links.remove(&link_id) {
            for user_id in user_ids {
                self.users.remove(&user_id);
            }
        }
    }

    pub fn find_route_by_user(&self, user_id: UserId) -> LinkId {
        self.users.get(&user_id).copied().unwrap_or(0)
    }

    pub fn find_route_by_server(
        &self,
        server_type: ServerType,
        server_id: ServerId,
        server_index: ServerIndex,
    ) -> LinkId {
        self.routes
            .get(&pack_route_id(server_type, server_id, server_index))
            .copied()
            .unwrap_or(0)
    }

    /// Every route registered under a server type.
    pub fn find_server_type_routes(&self, server_type: ServerType) -> Option<&RouteMap> {
        self.server_types.get(&server_type)
    }

    /// Every route registered under a (type, id) pair.
    pub fn find_server_type_id_routes(
        &self,
        server_type: ServerType,
        server_id: ServerId,
    ) -> Option<&RouteMap> {
        self.server_type_ids.get(&pack_server_type_id(server_type, server_id))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn route_id_packing() {
        let id = pack_route_id(3, 0x0102_0304, 9);
        assert_eq!(id, (3i64 << 48) | (0x0102_0304i64 << 16) | 9);
    }

    #[test]
    fn user_routes_are_exclusive() {
        let mut mgr = RouteMgr::new();
        mgr.add_route_by_user(7, 100).unwrap();
        assert!(matches!(mgr.add_route_by_user(7, 200), Err(NetError::LinkRouteExist)));
        assert_eq!(mgr.find_route_by_user(7), 100);
        assert_eq!(mgr.find_route_by_user(8), 0);
    }

    #[test]
    fn server_routes_and_prefix_lookups() {
        let mut mgr = RouteMgr::new();
        mgr.add_route_by_server(1, 10, 0, 100).unwrap();
        mgr.add_route_by_server(1, 10, 1, 101).unwrap();
        mgr.add_route_by_server(1, 11, 0, 102).unwrap();
        mgr.add_route_by_server(2, 10, 0, 103).unwrap();
        assert!(matches!(
            mgr.add_route_by_server(1, 10, 0, 999),
            Err(NetError::LinkRouteExist)
        ));

        assert_eq!(mgr.find_route_by_server(1, 10, 1), 101);
        assert_eq!(mgr.find_server_type_routes(1).map(HashMap::len), Some(3));
        assert_eq!(mgr.find_server_type_id_routes(1, 10).map(HashMap::len), Some(2));
        assert!(mgr.find_server_type_routes(9).is_none());
    }

    #[test]
    fn remove_prunes_every_index() {
        let mut mgr = RouteMgr::new();
        mgr.add_route_by_user(7, 100).unwrap();
        mgr.add_route_by_user(9, 100).unwrap();
        mgr.add_route_by_server(1, 10, 0, 100).unwrap();
        mgr.add_route_by_server(1, 10, 1, 200).unwrap();

        mgr.remove_route(100);

        assert_eq!(mgr.find_route_by_user(7), 0);
        assert_eq!(mgr.find_route_by_user(9), 0);
        assert_eq!(mgr.find_route_by_server(1, 10, 0), 0);
        assert_eq!(mgr.find_route_by_server(1, 10, 1), 200);
        assert_eq!(mgr.find_server_type_routes(1).map(HashMap::len), Some(1));
        // A re-add after removal succeeds.
        mgr.add_route_by_user(7, 300).unwrap();
    }
}
