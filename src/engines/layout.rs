//! Record names shared by the adapters. The leading digit is the record type.

pub(crate) const GUID_KEY: &str = "dps_and_dl_guid";

pub(crate) fn store_name_key(encoded_name: &str) -> String {
    format!("0{encoded_name}")
}

pub(crate) fn store_info_key(store: u64) -> String {
    format!("1{store}")
}

pub(crate) fn catalog_key(store: u64, segment: u32) -> String {
    format!("2{store}_{segment}")
}

pub(crate) fn item_key(store: u64, encoded_key: &str) -> String {
    format!("3{store}_{encoded_key}")
}

pub(crate) fn store_lock_key(store: u64) -> String {
    format!("4{store}dps_lock")
}

pub(crate) fn lock_name_key(encoded_name: &str) -> String {
    format!("5{encoded_name}")
}

pub(crate) fn lock_info_key(lock: u64) -> String {
    format!("6{lock}")
}

pub(crate) fn lock_key(lock: u64) -> String {
    format!("7{lock}dl_lock")
}

pub(crate) fn general_lock_key(entity: &str) -> String {
    format!("501{entity}generic_lock")
}
