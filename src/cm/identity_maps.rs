use std::cmp::Ordering;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::cm::cep::{Cep, Discriminator, Endpoint};
use crate::cm::cep_arena::CepId;
use crate::cm::cm_error::CmError;
use crate::messaging::cm_messages::{ReqMessage, SidrReqMessage};
use crate::messaging::mad::Gid;


/// The address a CEP is bound to in the listen map: listeners, SIDR registrations and peer
///  connects that are not yet associated with a remote endpoint. `None` matches everything.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListenKey {
    pub service_id: u64,
    pub local_gid: Option<Gid>,
    pub local_lid: Option<u16>,
    pub remote_gid: Option<Gid>,
    pub remote_lid: Option<u16>,
    pub discriminator: Option<Discriminator>,
    /// local endpoint, for peer connects only
    pub peer: Option<Endpoint>,
}

fn wildcard_cmp<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

/// zero addresses in a message are wildcards too
fn non_zero_gid(gid: Gid) -> Option<Gid> {
    Some(gid).filter(|g| !g.is_zero())
}
fn non_zero_lid(lid: u16) -> Option<u16> {
    Some(lid).filter(|l| *l != 0)
}

impl ListenKey {
    /// Order between bound listen addresses. Equality means the two would compete for the same
    ///  inbound requests.
    pub fn listen_cmp(&self, other: &ListenKey) -> Ordering {
        self.service_id.cmp(&other.service_id)
            .then_with(|| wildcard_cmp(&self.local_gid, &other.local_gid))
            .then_with(|| wildcard_cmp(&self.local_lid, &other.local_lid))
            .then_with(|| match (&self.peer, &other.peer) {
                (Some(a), Some(b)) => a.cmp(b),
                _ => Ordering::Equal,
            })
            .then_with(|| wildcard_cmp(&self.remote_gid, &other.remote_gid))
            .then_with(|| wildcard_cmp(&self.remote_lid, &other.remote_lid))
            .then_with(|| match (&self.discriminator, &other.discriminator) {
                (Some(a), Some(b)) => a.data.len().cmp(&b.data.len())
                    .then_with(|| a.data.cmp(&b.data)),
                _ => Ordering::Equal,
            })
    }

    /// Does an inbound REQ address this key? The REQ's primary path is from the sender's
    ///  perspective, so its 'remote' is our 'local'.
    pub fn matches_req(&self, req: &ReqMessage) -> bool {
        let ordering = self.service_id.cmp(&req.service_id)
            .then_with(|| wildcard_cmp(&self.local_gid, &non_zero_gid(req.primary.remote_gid)))
            .then_with(|| wildcard_cmp(&self.local_lid, &non_zero_lid(req.primary.remote_lid)))
            .then_with(|| wildcard_cmp(&self.remote_gid, &non_zero_gid(req.primary.local_gid)))
            .then_with(|| wildcard_cmp(&self.remote_lid, &non_zero_lid(req.primary.local_lid)))
            .then_with(|| match &self.discriminator {
                Some(d) => d.cmp_private_data(req.private_data.as_bytes()),
                None => Ordering::Equal,
            });
        ordering == Ordering::Equal
    }

    pub fn matches_sidr_req(&self, req: &SidrReqMessage) -> bool {
        self.service_id == req.service_id
            && self.discriminator.as_ref()
                .map(|d| d.cmp_private_data(req.private_data.as_bytes()) == Ordering::Equal)
                .unwrap_or(true)
    }

    /// the listen key of a CEP that was set up for a peer connect
    pub fn for_peer(cep: &Cep) -> ListenKey {
        ListenKey {
            service_id: cep.service_id,
            local_gid: non_zero_gid(cep.primary_path.local_gid),
            local_lid: non_zero_lid(cep.primary_path.local_lid),
            remote_gid: non_zero_gid(cep.primary_path.remote_gid),
            remote_lid: non_zero_lid(cep.primary_path.remote_lid),
            discriminator: cep.discriminator.clone(),
            peer: Some(cep.local_endpoint),
        }
    }
}


/// The keyed containers used to find the CEP an inbound message belongs to. Membership is a
///  function of the CEP's state; the owners of the state transitions keep it consistent.
#[derive(Default)]
pub struct IdentityMaps {
    local_comm_ids: FxHashMap<u32, CepId>,
    local_endpoints: FxHashMap<Endpoint, CepId>,
    remote_endpoints: FxHashMap<Endpoint, CepId>,
    /// buckets per service id, matched linearly because wildcards do not form a total order
    listen: FxHashMap<u64, Vec<(ListenKey, CepId)>>,
    queries: FxHashMap<u32, CepId>,
}

impl IdentityMaps {
    pub fn comm_id_in_use(&self, local_comm_id: u32) -> bool {
        self.local_comm_ids.contains_key(&local_comm_id)
    }

    pub fn insert_comm_id(&mut self, local_comm_id: u32, id: CepId) {
        self.local_comm_ids.insert(local_comm_id, id);
    }

    pub fn remove_comm_id(&mut self, local_comm_id: u32, id: CepId) {
        if self.local_comm_ids.get(&local_comm_id) == Some(&id) {
            self.local_comm_ids.remove(&local_comm_id);
        }
    }

    pub fn by_comm_id(&self, local_comm_id: u32) -> Option<CepId> {
        self.local_comm_ids.get(&local_comm_id).copied()
    }

    pub fn try_insert_local_endpoint(&mut self, endpoint: Endpoint, id: CepId) -> Result<(), CmError> {
        try_insert(&mut self.local_endpoints, endpoint, id)
    }

    pub fn try_insert_remote_endpoint(&mut self, endpoint: Endpoint, id: CepId) -> Result<(), CmError> {
        try_insert(&mut self.remote_endpoints, endpoint, id)
    }

    pub fn by_remote_endpoint(&self, endpoint: &Endpoint) -> Option<CepId> {
        self.remote_endpoints.get(endpoint).copied()
    }

    /// remove both endpoints of a CEP, as far as they are mapped to it
    pub fn remove_endpoints(&mut self, id: CepId, cep: &Cep) {
        if self.local_endpoints.get(&cep.local_endpoint) == Some(&id) {
            self.local_endpoints.remove(&cep.local_endpoint);
        }
        if self.remote_endpoints.get(&cep.remote_endpoint) == Some(&id) {
            self.remote_endpoints.remove(&cep.remote_endpoint);
        }
    }

    pub fn try_insert_listen(&mut self, key: ListenKey, id: CepId) -> Result<(), CmError> {
        let bucket = self.listen.entry(key.service_id).or_default();
        if bucket.iter().any(|(k, _)| k.listen_cmp(&key) == Ordering::Equal) {
            trace!("listen address {:?} is already bound", key);
            return Err(CmError::AddrInUse);
        }
        bucket.push((key, id));
        Ok(())
    }

    pub fn remove_listen(&mut self, service_id: u64, id: CepId) -> bool {
        let Some(bucket) = self.listen.get_mut(&service_id) else {
            return false;
        };
        let len_before = bucket.len();
        bucket.retain(|(_, i)| *i != id);
        let removed = bucket.len() != len_before;
        if bucket.is_empty() {
            self.listen.remove(&service_id);
        }
        removed
    }

    pub fn is_listening(&self, service_id: u64, id: CepId) -> bool {
        self.listen.get(&service_id)
            .map(|b| b.iter().any(|(_, i)| *i == id))
            .unwrap_or(false)
    }

    /// all listen entries addressed by an inbound REQ, in insertion order
    pub fn listen_matches_req<'a>(&'a self, req: &'a ReqMessage) -> impl Iterator<Item=(&'a ListenKey, CepId)> + 'a {
        self.listen.get(&req.service_id)
            .into_iter()
            .flat_map(|b| b.iter())
            .filter(move |(k, _)| k.matches_req(req))
            .map(|(k, id)| (k, *id))
    }

    pub fn listen_match_sidr(&self, req: &SidrReqMessage) -> Option<CepId> {
        self.listen.get(&req.service_id)?
            .iter()
            .find(|(k, _)| k.matches_sidr_req(req))
            .map(|(_, id)| *id)
    }

    pub fn insert_query(&mut self, request_id: u32, id: CepId) {
        self.queries.insert(request_id, id);
    }

    pub fn remove_query(&mut self, request_id: u32) -> Option<CepId> {
        self.queries.remove(&request_id)
    }

    pub fn by_query(&self, request_id: u32) -> Option<CepId> {
        self.queries.get(&request_id).copied()
    }
}

fn try_insert(map: &mut FxHashMap<Endpoint, CepId>, endpoint: Endpoint, id: CepId) -> Result<(), CmError> {
    match map.get(&endpoint) {
        Some(existing) if *existing == id => Ok(()),
        Some(_) => Err(CmError::AddrInUse),
        None => {
            map.insert(endpoint, id);
            Ok(())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::cm::cep_arena::CepArena;
    use crate::messaging::codes::CepType;
    use crate::messaging::mad::FixedData;

    fn ids(n: usize) -> Vec<CepId> {
        let mut arena = CepArena::default();
        (0..n).map(|_| arena.insert(Cep::new(CepType::ReliableConnection, None))).collect()
    }

    fn gid(n: u64) -> Gid {
        Gid::new(0xfe80_0000_0000_0000, n)
    }

    fn key(service_id: u64) -> ListenKey {
        ListenKey { service_id, ..Default::default() }
    }

    fn req(service_id: u64, private_data: &[u8]) -> ReqMessage {
        let mut req = crate::test_util::fabric::req_message(1, service_id);
        req.primary.local_lid = 10;
        req.primary.remote_lid = 20;
        req.primary.local_gid = gid(10);
        req.primary.remote_gid = gid(20);
        req.private_data = FixedData::from_slice(private_data).unwrap();
        req
    }

    #[rstest]
    #[case::different_sid(key(2), false)]
    #[case::wildcard(key(1), true)]
    #[case::same_local_lid(ListenKey { local_lid: Some(20), ..key(1) }, true)]
    #[case::local_lid_vs_remote(ListenKey { local_lid: Some(10), ..key(1) }, false)]
    #[case::remote_gid(ListenKey { remote_gid: Some(gid(10)), ..key(1) }, true)]
    #[case::wrong_remote_gid(ListenKey { remote_gid: Some(gid(20)), ..key(1) }, false)]
    #[case::discriminator(ListenKey { discriminator: Some(Discriminator { data: vec![7, 8], offset: 1 }), ..key(1) }, true)]
    #[case::wrong_discriminator(ListenKey { discriminator: Some(Discriminator { data: vec![7, 8], offset: 0 }), ..key(1) }, false)]
    fn test_matches_req(#[case] key: ListenKey, #[case] expected: bool) {
        assert_eq!(key.matches_req(&req(1, &[6, 7, 8])), expected);
    }

    #[rstest]
    #[case::disjoint_sid(key(1), key(2), false)]
    #[case::both_wildcard(key(1), key(1), true)]
    #[case::one_wildcard(key(1), ListenKey { local_lid: Some(3), ..key(1) }, true)]
    #[case::different_lids(ListenKey { local_lid: Some(4), ..key(1) }, ListenKey { local_lid: Some(3), ..key(1) }, false)]
    #[case::different_peers(ListenKey { peer: Some(Endpoint::new(1, 1, 0)), ..key(1) }, ListenKey { peer: Some(Endpoint::new(1, 2, 0)), ..key(1) }, false)]
    #[case::different_discriminator_len(
        ListenKey { discriminator: Some(Discriminator { data: vec![1], offset: 0 }), ..key(1) },
        ListenKey { discriminator: Some(Discriminator { data: vec![1, 2], offset: 0 }), ..key(1) },
        false)]
    fn test_listen_conflicts(#[case] a: ListenKey, #[case] b: ListenKey, #[case] conflict: bool) {
        let ids = ids(2);
        let mut maps = IdentityMaps::default();
        maps.try_insert_listen(a, ids[0]).unwrap();
        assert_eq!(maps.try_insert_listen(b, ids[1]).is_err(), conflict);
    }

    #[test]
    fn test_listen_remove() {
        let ids = ids(2);
        let mut maps = IdentityMaps::default();
        maps.try_insert_listen(ListenKey { local_lid: Some(20), ..key(1) }, ids[0]).unwrap();
        maps.try_insert_listen(ListenKey { local_lid: Some(21), ..key(1) }, ids[1]).unwrap();

        let req = req(1, &[]);
        assert_eq!(maps.listen_matches_req(&req).map(|(_, id)| id).collect::<Vec<_>>(), vec![ids[0]]);

        assert!(maps.remove_listen(1, ids[0]));
        assert!(!maps.remove_listen(1, ids[0]));
        assert!(!maps.is_listening(1, ids[0]));
        assert!(maps.is_listening(1, ids[1]));
        assert_eq!(maps.listen_matches_req(&req).count(), 0);
    }

    #[test]
    fn test_endpoints() {
        let ids = ids(2);
        let mut maps = IdentityMaps::default();
        let ep = Endpoint::new(5, 9, 0);
        maps.try_insert_remote_endpoint(ep, ids[0]).unwrap();
        maps.try_insert_remote_endpoint(ep, ids[0]).unwrap();
        assert!(matches!(maps.try_insert_remote_endpoint(ep, ids[1]), Err(CmError::AddrInUse)));
        assert_eq!(maps.by_remote_endpoint(&ep), Some(ids[0]));

        let mut cep = Cep::new(CepType::ReliableConnection, None);
        cep.remote_endpoint = ep;
        maps.remove_endpoints(ids[1], &cep);
        assert_eq!(maps.by_remote_endpoint(&ep), Some(ids[0]));
        maps.remove_endpoints(ids[0], &cep);
        assert_eq!(maps.by_remote_endpoint(&ep), None);
    }

    #[test]
    fn test_sidr_match() {
        let ids = ids(1);
        let mut maps = IdentityMaps::default();
        maps.try_insert_listen(ListenKey { discriminator: Some(Discriminator { data: vec![1, 2], offset: 0 }), ..key(5) }, ids[0]).unwrap();

        let mut req = SidrReqMessage {
            request_id: 1,
            partition_key: 0xffff,
            service_id: 5,
            private_data: FixedData::from_slice(&[1, 2, 3]).unwrap(),
        };
        assert_eq!(maps.listen_match_sidr(&req), Some(ids[0]));
        req.private_data = FixedData::from_slice(&[1, 3]).unwrap();
        assert_eq!(maps.listen_match_sidr(&req), None);
    }
}
