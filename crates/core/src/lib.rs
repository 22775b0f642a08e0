pub mod bulk_export;
pub mod catalog;
pub mod completion;
pub mod pagination;
pub mod panel;
pub mod query_service;
pub mod row_counter;
pub mod sessions;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;
