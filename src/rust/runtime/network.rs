// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    parcel::Parcel,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::std::sync::Arc;

//======================================================================================================================
// Traits
//======================================================================================================================

/// Moves parcels between localities. Parcels handed to [Transport::deliver] come out of the target locality's
/// [Transport::probe], where its workers turn them into lightweight threads.
pub trait Transport: Send + Sync {
    fn rank(&self) -> u32;

    fn ranks(&self) -> u32;

    fn deliver(&self, locality: u32, parcel: Box<Parcel>) -> Result<(), Fail>;

    /// Returns a parcel that arrived for this locality, if any. Never blocks.
    fn probe(&self) -> Option<Box<Parcel>>;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// In-process transport: every endpoint of a fabric holds a channel to every other endpoint.
pub struct Loopback {
    rank: u32,
    peers: Vec<Sender<Box<Parcel>>>,
    inbox: Receiver<Box<Parcel>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Loopback {
    /// Builds `ranks` connected endpoints. Endpoint `i` serves locality `i`.
    pub fn fabric(ranks: u32) -> Vec<Arc<Loopback>> {
        let (senders, receivers): (Vec<Sender<Box<Parcel>>>, Vec<Receiver<Box<Parcel>>>) =
            (0..ranks).map(|_| ::crossbeam_channel::unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| {
                Arc::new(Loopback {
                    rank: rank as u32,
                    peers: senders.clone(),
                    inbox,
                })
            })
            .collect()
    }

    /// Transport of a runtime with a single locality.
    pub fn single() -> Arc<Loopback> {
        let (sender, inbox): (Sender<Box<Parcel>>, Receiver<Box<Parcel>>) = ::crossbeam_channel::unbounded();
        Arc::new(Loopback {
            rank: 0,
            peers: vec![sender],
            inbox,
        })
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Transport for Loopback {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn ranks(&self) -> u32 {
        self.peers.len() as u32
    }

    fn deliver(&self, locality: u32, parcel: Box<Parcel>) -> Result<(), Fail> {
        if parcel.is_started() {
            let cause: String = format!("cannot send a running lightweight thread (parcel={:?})", parcel);
            error!("deliver(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let peer: &Sender<Box<Parcel>> = match self.peers.get(locality as usize) {
            Some(peer) => peer,
            None => {
                let cause: String = format!("no such locality (rank={})", locality);
                error!("deliver(): {}", &cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        if peer.send(parcel).is_err() {
            let cause: String = format!("locality is gone (rank={})", locality);
            error!("deliver(): {}", &cause);
            return Err(Fail::new(libc::EPIPE, &cause));
        }
        Ok(())
    }

    fn probe(&self) -> Option<Box<Parcel>> {
        self.inbox.try_recv().ok()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
