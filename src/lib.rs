//! Client for a data portal's search action API: composing queries over a
//! filter tree, paging through `datastore_multisearch`, collecting results
//! with their images, and sharing queries through slugs.

pub mod outbound;
pub mod query;
pub mod resources;
pub mod search;
pub mod settings;
pub mod slug;

#[cfg(test)]
mod testing;
mod utils;

pub use crate::{
    outbound::{ApiError, Portal, PortalClient},
    query::Query,
    search::SearchContext,
    settings::Settings,
};
