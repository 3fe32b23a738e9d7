/*!
bgpmon is a long-running BGP route collector: it maintains concurrent
BGP-4 peering sessions, ingests MRT feeds from external routing daemons,
classifies every update against a per-peer routing table, and fans the
labeled stream out to any number of subscribers.

The pipeline, producer to consumer:

```text
peer TCP <-> session engine -> peer queue -> labeling engine
   -> labeled queue -> subscriber writers (updates / RIB streams)
MRT TCP  -> backlog -> MRT parser ---^ (as though from a live session)
```

The building blocks are usable on their own: [`queue`] is a bounded
multi-reader ring, [`labeling`] holds the prefix/attribute stores and the
classification rules, [`parser`] the BGP and MRT codecs, and [`daemon`]
wires the whole process together.
*/
pub mod chains;
pub mod clients;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod labeling;
pub mod models;
pub mod mrt;
pub mod parser;
pub mod periodic;
pub mod queue;
pub mod session;
pub mod shutdown;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{MonitorError, ParserError};
pub use models::{Bmf, BmfType};
