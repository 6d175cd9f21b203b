//! Configuration-plane scenarios: transactions, destroy ordering,
//! dryrun isolation, idempotence, and snapshot round-trips.
