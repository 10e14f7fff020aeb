use uuid::Uuid;

/// First 8 hex chars of the uuid, used for container names and log prefixes.
pub fn to_short_id(id: &Uuid) -> String {
    id.to_string().split_at(8).0.to_string()
}
