//! Address creation for HD accounts.

mod batch;

pub use batch::{AddressDecoder, DeriveError, batch_create_address_by_account};
