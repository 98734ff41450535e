//! UUID generation helpers.

use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a new UUID v7 (time-ordered).
///
/// Submission ids use v7 so queue listings sort by creation order.
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uuid_v4() {
        let id = generate_uuid();
        assert_eq!(id.get_version_num(), 4);
    }

    #[test]
    fn test_generate_uuid_v7_is_ordered() {
        let a = generate_uuid_v7();
        let b = generate_uuid_v7();
        assert_eq!(a.get_version_num(), 7);
        assert!(a <= b);
    }
}
