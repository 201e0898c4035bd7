// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::all)]

mod integration_tests {
    pub mod common;

    pub mod login_chap_ok;
    pub mod login_plain_ok;
    pub mod logout_ok;
}
