/*
 * plain.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, an IMAP client core.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! PLAIN SASL (RFC 4616).

use super::SaslError;

/// NUL authzid NUL authcid NUL password. Base64 is applied by the caller.
pub fn encode_plain(authzid: &str, authcid: &str, password: &str) -> Result<Vec<u8>, SaslError> {
    if [authzid, authcid, password].iter().any(|s| s.contains('\0')) {
        return Err(SaslError::InvalidCredentials("NUL in PLAIN credentials".into()));
    }
    Ok(format!("{}\0{}\0{}", authzid, authcid, password).into_bytes())
}
