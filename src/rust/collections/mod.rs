// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod id_map;
pub mod queue;
