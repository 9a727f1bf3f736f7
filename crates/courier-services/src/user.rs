use std::sync::Arc;

use uuid::Uuid;

use courier_db::users::ProfileUpdate;
use courier_db::{is_unique_violation, Database};
use courier_types::api::UpdateProfileRequest;
use courier_types::models::User;

use crate::ServiceError;

#[derive(Clone)]
pub struct UserService {
    db: Arc<Database>,
}

impl UserService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, user_id: Uuid) -> Result<User, ServiceError> {
        self.db
            .get_user(user_id)?
            .ok_or(ServiceError::NotFound("user"))
    }

    /// Apply a partial profile update. The password hash and id are not
    /// reachable through this path.
    pub fn update(&self, user_id: Uuid, req: UpdateProfileRequest) -> Result<(), ServiceError> {
        let update = ProfileUpdate {
            email: req.email,
            phone: req.phone,
            profile_picture: req.profile_picture,
            status_message: req.status_message,
            read_receipts: req.settings.as_ref().map(|s| s.read_receipts),
            last_seen_privacy: req.settings.as_ref().map(|s| s.last_seen_privacy),
        };
        self.db.update_user_profile(user_id, &update)?;
        Ok(())
    }

    pub fn search(&self, query: &str, limit: i64) -> Result<Vec<User>, ServiceError> {
        Ok(self.db.search_users(query, limit)?)
    }

    pub fn contacts(&self, user_id: Uuid) -> Result<Vec<User>, ServiceError> {
        Ok(self.db.contacts_for_user(user_id)?)
    }

    pub fn add_contact(
        &self,
        user_id: Uuid,
        contact_id: Uuid,
        display_name: Option<&str>,
    ) -> Result<(), ServiceError> {
        // The target must exist before the edge does
        if self.db.get_user(contact_id)?.is_none() {
            return Err(ServiceError::NotFound("user"));
        }

        self.db
            .add_contact(user_id, contact_id, display_name)
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ServiceError::DuplicateContact
                } else {
                    ServiceError::Store(e)
                }
            })?;
        Ok(())
    }

    pub fn remove_contact(&self, user_id: Uuid, contact_id: Uuid) -> Result<(), ServiceError> {
        self.db.remove_contact(user_id, contact_id)?;
        Ok(())
    }
}
