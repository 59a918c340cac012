use crate::database::UserDb;
use crate::error::{Error, Result};
use crate::model::User;
use actix_identity::Identity;
use log::{debug, info, warn};

pub struct Auth {
    bcrypt_cost: u32,
}

fn is_bcrypt_hash(stored: &str) -> bool {
    stored.len() == 60 && stored.starts_with("$2")
}

// Records created before hashing was introduced hold the password verbatim.
fn verify_password(password: &str, stored: &str) -> bool {
    if !is_bcrypt_hash(stored) {
        return password == stored;
    }
    bcrypt::verify(password, stored).unwrap_or_else(|err| {
        debug!("Stored password is not a valid bcrypt hash ({}), comparing as plaintext", err);
        password == stored
    })
}

impl Auth {
    pub fn new(bcrypt_cost: u32) -> Self {
        Auth { bcrypt_cost }
    }

    pub fn register<D>(&self, db: &D, username: &str, password: &str, password2: &str) -> Result<()>
    where
        D: UserDb,
        Error: From<D::Error>,
    {
        if username.is_empty() {
            return Err(Error::MissingField("username"));
        }
        if db.get_user(username).is_some() {
            return Err(Error::DuplicateUser);
        }
        if password != password2 {
            return Err(Error::PasswordMismatch);
        }
        let user = User {
            password: bcrypt::hash(password, self.bcrypt_cost)?,
            qr_codes: Vec::new(),
        };
        if !db.add_user(username, user)? {
            return Err(Error::DuplicateUser);
        }
        info!("Registered user {}", username);
        Ok(())
    }

    pub fn login<D: UserDb>(&self, db: &D, username: &str, password: &str) -> Result<()> {
        let user = db.get_user(username).ok_or_else(|| {
            info!("Login for unknown user {}", username);
            Error::InvalidCredentials
        })?;
        if !verify_password(password, &user.password) {
            warn!("Wrong password for user {}", username);
            return Err(Error::InvalidCredentials);
        }
        info!("{} logged in", username);
        Ok(())
    }
}

pub fn logout(id: Option<Identity>) {
    if let Some(id) = id {
        if let Ok(username) = id.id() {
            info!("{} logged out", username);
        }
        id.logout();
    }
}
