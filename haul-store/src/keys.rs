//! Key encoding for the `parts` tree.
//!
//! A part row's composite key `(upload_id, part_number)` is encoded as
//! `upload_id bytes ++ 0x00 ++ part_number big-endian u32`, so a prefix scan
//! on `job_prefix(upload_id)` visits every part of one job in ascending
//! `part_number` order for free (big-endian integers sort byte-lexically).

pub fn job_prefix(upload_id: &str) -> Vec<u8> {
    let mut key = upload_id.as_bytes().to_vec();
    key.push(0);
    key
}

pub fn part_key(upload_id: &str, part_number: u32) -> Vec<u8> {
    let mut key = job_prefix(upload_id);
    key.extend_from_slice(&part_number.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_order_is_ascending_part_number() {
        let mut keys = vec![
            part_key("job-1", 10),
            part_key("job-1", 2),
            part_key("job-1", 1),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![part_key("job-1", 1), part_key("job-1", 2), part_key("job-1", 10)]
        );
    }

    #[test]
    fn prefix_does_not_cross_upload_ids() {
        // "job-1" is not a byte-prefix of "job-10"'s part keys because of the
        // 0x00 separator — without it, job_prefix("job-1") would also match
        // job-10's rows.
        let prefix_1 = job_prefix("job-1");
        let key_10 = part_key("job-10", 1);
        assert!(!key_10.starts_with(&prefix_1));
    }
}
