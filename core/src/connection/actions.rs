// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The action dispatch table (§4.3, §9 "dynamic dispatch"): a fixed
//! enumeration modeled as a tagged variant rather than a free-form map, so
//! the external JSON is parsed into variant-specific records once, at
//! entry, and everything downstream is statically typed.

use serde::Deserialize;
use serde_json::Value;

use crate::identifiers::DatabaseId;
use crate::txlog::Command;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ValidateKeyParams {
    /// Transported as a JSON byte array for simplicity, since the wire
    /// format itself is opaque to the server either way.
    pub decrypted_nonce: Vec<u8>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserParams {
    pub username: Option<String>,
    pub email: Option<String>,
    pub profile: Option<Vec<u8>>,
    pub new_password_token: Option<Vec<u8>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OpenDatabaseParams {
    pub db_id: DatabaseId,
    pub name_hash: Vec<u8>,
    pub new_database_params: Option<Vec<u8>>,
    pub reopen_at_seq_no: Option<u64>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WriteParams {
    pub db_id: DatabaseId,
    pub item_key: Vec<u8>,
    pub encrypted_item: Vec<u8>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemParams {
    pub command: Command,
    pub item_key: Vec<u8>,
    pub encrypted_item: Vec<u8>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BatchTransactionParams {
    pub db_id: DatabaseId,
    pub items: Vec<BatchItemParams>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BundleParams {
    pub db_id: DatabaseId,
    pub seq_no: u64,
    pub bundle: Vec<u8>,
}

/// The fixed action enumeration reachable from `Active` (§4.3's dispatch
/// table) plus `ValidateKey`, which is only reachable from
/// `AwaitingKeyValidation`.
#[derive(Debug)]
pub enum Action {
    ValidateKey(ValidateKeyParams),
    SignOut,
    UpdateUser(UpdateUserParams),
    DeleteUser,
    OpenDatabase(OpenDatabaseParams),
    Insert(WriteParams),
    Update(WriteParams),
    Delete(WriteParams),
    BatchTransaction(BatchTransactionParams),
    Bundle(BundleParams),
    GetPasswordSalts,
    Pong,
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownAction;

impl Action {
    /// Parse `(action, params)` into a typed [`Action`]. An unrecognized
    /// action name, or params that don't match the named action's shape,
    /// both surface as [`UnknownAction`] — per §9's open question, this
    /// path never builds a structured `response`, only the plain-text error
    /// of §4.3.
    pub fn parse(name: &str, params: Value) -> Result<Action, UnknownAction> {
        fn from_params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, UnknownAction> {
            serde_json::from_value(params).map_err(|_| UnknownAction)
        }

        match name {
            "ValidateKey" => Ok(Action::ValidateKey(from_params(params)?)),
            "SignOut" => Ok(Action::SignOut),
            "UpdateUser" => Ok(Action::UpdateUser(from_params(params)?)),
            "DeleteUser" => Ok(Action::DeleteUser),
            "OpenDatabase" => Ok(Action::OpenDatabase(from_params(params)?)),
            "Insert" => Ok(Action::Insert(from_params(params)?)),
            "Update" => Ok(Action::Update(from_params(params)?)),
            "Delete" => Ok(Action::Delete(from_params(params)?)),
            "BatchTransaction" => Ok(Action::BatchTransaction(from_params(params)?)),
            "Bundle" => Ok(Action::Bundle(from_params(params)?)),
            "GetPasswordSalts" => Ok(Action::GetPasswordSalts),
            "Pong" => Ok(Action::Pong),
            _ => Err(UnknownAction),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::ValidateKey(_) => "ValidateKey",
            Action::SignOut => "SignOut",
            Action::UpdateUser(_) => "UpdateUser",
            Action::DeleteUser => "DeleteUser",
            Action::OpenDatabase(_) => "OpenDatabase",
            Action::Insert(_) => "Insert",
            Action::Update(_) => "Update",
            Action::Delete(_) => "Delete",
            Action::BatchTransaction(_) => "BatchTransaction",
            Action::Bundle(_) => "Bundle",
            Action::GetPasswordSalts => "GetPasswordSalts",
            Action::Pong => "Pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_action_with_matching_params() {
        let params = serde_json::json!({
            "dbId": uuid::Uuid::nil(),
            "itemKey": [1, 2],
            "encryptedItem": [3, 4],
        });
        let action = Action::parse("Insert", params).unwrap();
        assert_eq!(action.name(), "Insert");
        let _ = Action::parse("Insert", Value::Null);
    }

    #[test]
    fn unknown_action_name_is_rejected() {
        assert_eq!(
            Action::parse("DoSomethingElse", Value::Null).unwrap_err(),
            UnknownAction
        );
    }

    #[test]
    fn mismatched_params_are_rejected() {
        let err = Action::parse("Insert", serde_json::json!({"nope": true})).unwrap_err();
        assert_eq!(err, UnknownAction);
    }
}
